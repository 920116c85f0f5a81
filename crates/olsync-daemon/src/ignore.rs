//! Default ignore rules for a LaTeX project directory.

use olsync_core::IgnorePredicate;

/// Extensions the LaTeX toolchain writes next to the main document.
const BUILD_ARTEFACTS: &[&str] = &[
    "pdf",
    "aux",
    "log",
    "synctex.gz",
    "fls",
    "fdb_latexmk",
    "out",
    "toc",
    "bbl",
    "blg",
    "lof",
    "lot",
    "nav",
    "snm",
];

/// Ignores hidden paths (including the daemon's own state directory) and the
/// build artefacts of the main document.
#[derive(Debug, Clone)]
pub struct DefaultIgnore {
    artefacts: Vec<String>,
}

impl DefaultIgnore {
    /// `main_doc` is the main document's file name, e.g. `main.tex`.
    pub fn new(main_doc: &str) -> Self {
        let stem = main_doc
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(main_doc);
        Self {
            artefacts: BUILD_ARTEFACTS
                .iter()
                .map(|ext| format!("{}.{}", stem, ext))
                .collect(),
        }
    }
}

impl IgnorePredicate for DefaultIgnore {
    fn should_ignore(&self, path: &str) -> bool {
        let path = path.trim_matches('/');
        if path.split('/').any(|segment| segment.starts_with('.')) {
            return true;
        }
        self.artefacts.iter().any(|artefact| path == artefact)
    }
}
