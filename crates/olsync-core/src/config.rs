use std::time::Duration;

/// Extensions synced as OT documents; everything else is uploaded as a binary file.
pub const DEFAULT_TEXT_EXTENSIONS: &[&str] = &[
    "tex", "bib", "cls", "sty", "bst", "bbx", "cbx", "lbx", "def", "cfg", "clo", "dtx", "ins",
    "ltx", "tikz", "txt", "md", "rtex", "rnw", "csv", "tsv", "json", "yaml", "yml", "xml", "lua",
    "py", "r", "m", "gnuplot", "asy", "latexmkrc",
];

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Bound on every request/response round trip
    pub request_timeout: Duration,
    /// Bound on one connection handshake attempt
    pub handshake_timeout: Duration,
    /// Changed content arriving this soon after the previous observation is suppressed
    pub debounce: Duration,
    /// Lowercase extensions (without the dot) treated as text documents
    pub text_extensions: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            debounce: Duration::from_millis(500),
            text_extensions: DEFAULT_TEXT_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

impl SyncConfig {
    /// Whether a local path should become a text document on the remote.
    pub fn is_text(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        let Some((stem, ext)) = name.rsplit_once('.') else {
            return false;
        };
        if stem.is_empty() && ext.is_empty() {
            return false;
        }
        let ext = ext.to_ascii_lowercase();
        self.text_extensions.iter().any(|allowed| *allowed == ext)
    }
}
