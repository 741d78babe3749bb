//! Remote working directory inference for upload targets.
//!
//! Evidence comes from two places: the scrollback at the moment of an upload
//! gesture (prompts, `cd` commands, `pwd` output) and out-of-band terminal
//! signals (OSC 7, window titles) observed while output streams by.

pub mod osc;
pub mod remote;
pub mod resolve;
pub mod scan;

pub use resolve::{PathSource, Resolution, ResolveContext};
pub use scan::{PathCandidates, DEFAULT_SCAN_LINES};

use osc::{OscScanner, OscSignal};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub path: String,
    pub source: PathSource,
    /// The UI shows these as "relative/unknown" rather than as a real path.
    pub is_relative: bool,
}

/// Per-session inference state that outlives a single upload gesture.
#[derive(Debug, Clone)]
pub struct PathTracker {
    last_known: Option<String>,
    home: Option<String>,
    osc: OscScanner,
    scan_limit: usize,
}

impl Default for PathTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_LINES)
    }
}

impl PathTracker {
    pub fn new(scan_limit: usize) -> Self {
        Self {
            last_known: None,
            home: None,
            osc: OscScanner::default(),
            scan_limit: scan_limit.max(1),
        }
    }

    pub fn last_known(&self) -> Option<&str> {
        self.last_known.as_deref()
    }

    pub fn home(&self) -> Option<&str> {
        self.home.as_deref()
    }

    pub fn set_home(&mut self, home: &str) {
        let home = home.trim();
        if remote::is_absolute(home) {
            self.home = Some(remote::normalize(home));
        }
    }

    /// Records an absolute directory; relative ones are ignored.
    pub fn remember(&mut self, path: &str) {
        if remote::is_absolute(path) {
            self.last_known = Some(remote::normalize(path));
        }
    }

    /// Feeds raw terminal output looking for directory hints.
    pub fn observe(&mut self, data: &[u8]) {
        for signal in self.osc.feed(data) {
            let dir = match signal {
                OscSignal::WorkingDirectory(path) => Some(path),
                OscSignal::Title(title) => osc::title_directory(&title)
                    .and_then(|dir| {
                        if remote::is_absolute(&dir) {
                            Some(dir)
                        } else {
                            remote::expand_home(&dir, self.home.as_deref())
                        }
                    }),
            };
            if let Some(dir) = dir {
                tracing::trace!(%dir, "directory hint from terminal");
                self.remember(&dir);
            }
        }
    }

    fn context(&self) -> ResolveContext<'_> {
        ResolveContext {
            last_known: self.last_known.as_deref(),
            home: self.home.as_deref(),
        }
    }

    pub fn candidates<S: AsRef<str>>(&self, scrollback: &[S]) -> PathCandidates {
        scan::scan(scrollback, self.scan_limit)
    }

    /// Resolves the directory an upload should target. Never fails: when the
    /// scrollback is inconclusive the fallback chain decides.
    pub fn infer<S: AsRef<str>>(&mut self, scrollback: &[S]) -> ResolvedTarget {
        let found = self.candidates(scrollback);
        let resolution = match resolve::resolve(&found, self.context()) {
            Resolution::Unresolved => resolve::fallback(self.context()),
            resolved => resolved,
        };
        let (path, source) = match resolution {
            Resolution::Resolved { path, source } => (path, source),
            Resolution::Unresolved => (".".to_string(), PathSource::Default),
        };
        self.remember(&path);
        tracing::debug!(%path, %source, "upload directory inferred");
        ResolvedTarget {
            is_relative: !remote::is_absolute(&path),
            path,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_updates_last_known() {
        let mut tracker = PathTracker::default();
        let target = tracker.infer(&["[root@host ~]# cd /var/www/web", "[root@host web]# "]);
        assert_eq!(target.path, "/var/www/web");
        assert!(!target.is_relative);
        assert_eq!(tracker.last_known(), Some("/var/www/web"));

        // Later scrollback with only a relative move builds on it.
        let target = tracker.infer(&["[root@host web]# cd static", "[root@host static]# "]);
        assert_eq!(target.path, "/var/www/web/static");
        assert_eq!(target.source, PathSource::RelativeCd);
    }

    #[test]
    fn empty_scrollback_is_relative_default() {
        let mut tracker = PathTracker::default();
        let target = tracker.infer::<&str>(&[]);
        assert_eq!(target.path, ".");
        assert!(target.is_relative);
        assert_eq!(tracker.last_known(), None);

        tracker.set_home("/home/dev");
        assert_eq!(tracker.infer::<&str>(&[]).source, PathSource::HomeDir);
    }

    #[test]
    fn osc_signals_feed_last_known() {
        let mut tracker = PathTracker::default();
        tracker.observe(b"\x1b]7;file://box/opt/app\x07");
        assert_eq!(tracker.last_known(), Some("/opt/app"));

        tracker.set_home("/home/dev");
        tracker.observe(b"\x1b]2;dev@box: ~/notes\x07");
        assert_eq!(tracker.last_known(), Some("/home/dev/notes"));

        tracker.observe(b"\x1b]0;vim\x07");
        assert_eq!(tracker.last_known(), Some("/home/dev/notes"));
        assert_eq!(tracker.infer::<&str>(&[]).path, "/home/dev/notes");
    }
}
