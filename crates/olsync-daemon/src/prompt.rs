//! Conflict questions answered on the terminal.

use async_trait::async_trait;
use olsync_core::conflict::{
    Conflict, ConflictAnswer, ConflictResolver, LocalOnlyAction, RemoteDeletedAction, Resolution,
};
use similar::TextDiff;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tokio::sync::Mutex;
use tracing::warn;

/// Lines of context around a changed region in the diff display.
const DIFF_CONTEXT: usize = 2;

/// Asks every question on stdin/stdout.
///
/// End of input answers every remaining question with the option that leaves
/// both sides alone.
pub struct TerminalResolver {
    input: Mutex<BufReader<Stdin>>,
}

impl TerminalResolver {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }

    /// Print `question` and return the first character of the answer.
    async fn ask_char(&self, question: &str) -> Option<char> {
        let mut input = self.input.lock().await;
        let mut stdout = tokio::io::stdout();
        loop {
            if stdout.write_all(question.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                return None;
            }
            let mut line = String::new();
            match input.read_line(&mut line).await {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    warn!("Failed to read answer: {}", e);
                    return None;
                }
            }
            if let Some(c) = line.trim().chars().next() {
                return Some(c);
            }
        }
    }
}

impl Default for TerminalResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConflictResolver for TerminalResolver {
    async fn ask(&self, conflict: &Conflict<'_>) -> ConflictAnswer {
        let question = format!(
            "\n{} differs locally and remotely.\n  [r]emote  [l]ocal  [s]kip  [R]emote for all  [L]ocal for all  [d]iff\n> ",
            conflict.path
        );
        // Case matters: upper case applies to every remaining conflict
        loop {
            return match self.ask_char(&question).await {
                None | Some('s') | Some('S') => ConflictAnswer::Skip,
                Some('r') => ConflictAnswer::UseRemote,
                Some('l') => ConflictAnswer::UseLocal,
                Some('R') => ConflictAnswer::AllRemote,
                Some('L') => ConflictAnswer::AllLocal,
                Some('d') | Some('D') => ConflictAnswer::ShowDiff,
                Some(_) => continue,
            };
        }
    }

    async fn show_diff(&self, conflict: &Conflict<'_>) {
        let local = String::from_utf8_lossy(conflict.local);
        let remote = String::from_utf8_lossy(conflict.remote);
        let rendered = render_diff(conflict.path, &local, &remote);
        let mut stdout = tokio::io::stdout();
        let _ = stdout.write_all(rendered.as_bytes()).await;
        let _ = stdout.flush().await;
    }

    async fn ask_after_diff(&self, conflict: &Conflict<'_>) -> Resolution {
        let question = format!("{}: [r]emote  [l]ocal  [s]kip\n> ", conflict.path);
        loop {
            return match self.ask_char(&question).await.map(|c| c.to_ascii_lowercase()) {
                None | Some('s') => Resolution::Skip,
                Some('r') => Resolution::UseRemote,
                Some('l') => Resolution::UseLocal,
                Some(_) => continue,
            };
        }
    }

    async fn remote_deleted(&self, path: &str) -> RemoteDeletedAction {
        let question = format!(
            "\n{} was deleted remotely.\n  [d]elete locally  [k]eep  [u]pload again\n> ",
            path
        );
        loop {
            return match self.ask_char(&question).await.map(|c| c.to_ascii_lowercase()) {
                None | Some('k') => RemoteDeletedAction::Keep,
                Some('d') => RemoteDeletedAction::DeleteLocal,
                Some('u') => RemoteDeletedAction::Reupload,
                Some(_) => continue,
            };
        }
    }

    async fn local_only(&self, path: &str) -> LocalOnlyAction {
        let question = format!("\n{} exists only locally.\n  [u]pload  [i]gnore\n> ", path);
        loop {
            return match self.ask_char(&question).await.map(|c| c.to_ascii_lowercase()) {
                None | Some('i') => LocalOnlyAction::Ignore,
                Some('u') => LocalOnlyAction::Upload,
                Some(_) => continue,
            };
        }
    }
}

/// Unified line diff from the local to the remote version of `path`.
pub fn render_diff(path: &str, local: &str, remote: &str) -> String {
    TextDiff::from_lines(local, remote)
        .unified_diff()
        .context_radius(DIFF_CONTEXT)
        .header(&format!("local/{}", path), &format!("remote/{}", path))
        .to_string()
}
