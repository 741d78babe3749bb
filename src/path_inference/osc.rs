use percent_encoding::percent_decode_str;

const MAX_OSC_LEN: usize = 4096;

/// Directory hints carried by OSC sequences.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OscSignal {
    /// OSC 7 `file://host/path`, percent-decoded.
    WorkingDirectory(String),
    /// OSC 0 / OSC 2 window title.
    Title(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Ground,
    Esc,
    Osc,
    OscEsc,
}

/// Incremental scanner for OSC sequences split across output chunks.
#[derive(Debug, Clone)]
pub struct OscScanner {
    state: ScanState,
    body: Vec<u8>,
}

impl Default for OscScanner {
    fn default() -> Self {
        Self {
            state: ScanState::Ground,
            body: Vec::new(),
        }
    }
}

impl OscScanner {
    pub fn feed(&mut self, data: &[u8]) -> Vec<OscSignal> {
        data.iter().filter_map(|&b| self.feed_byte(b)).collect()
    }

    fn feed_byte(&mut self, b: u8) -> Option<OscSignal> {
        match self.state {
            ScanState::Ground => {
                if b == 0x1b {
                    self.state = ScanState::Esc;
                }
                None
            }
            ScanState::Esc => {
                if b == b']' {
                    self.state = ScanState::Osc;
                    self.body.clear();
                } else if b != 0x1b {
                    self.state = ScanState::Ground;
                }
                None
            }
            ScanState::Osc => match b {
                0x07 => self.finish(),
                0x1b => {
                    self.state = ScanState::OscEsc;
                    None
                }
                _ => {
                    if self.body.len() < MAX_OSC_LEN {
                        self.body.push(b);
                    } else {
                        self.state = ScanState::Ground;
                        self.body.clear();
                    }
                    None
                }
            },
            ScanState::OscEsc => {
                if b == b'\\' {
                    self.finish()
                } else if b == b']' {
                    // ESC ] inside an unterminated OSC starts a new one.
                    self.state = ScanState::Osc;
                    self.body.clear();
                    None
                } else {
                    self.state = ScanState::Ground;
                    self.body.clear();
                    None
                }
            }
        }
    }

    fn finish(&mut self) -> Option<OscSignal> {
        self.state = ScanState::Ground;
        let body = std::mem::take(&mut self.body);
        let body = String::from_utf8_lossy(&body);
        let (code, rest) = body.split_once(';')?;
        match code {
            "7" => parse_file_url(rest).map(OscSignal::WorkingDirectory),
            "0" | "2" => Some(OscSignal::Title(rest.to_string())),
            _ => None,
        }
    }
}

fn parse_file_url(url: &str) -> Option<String> {
    let rest = url.strip_prefix("file://")?;
    // Skip the host part; the path starts at the next slash.
    let path = &rest[rest.find('/')?..];
    let decoded = percent_decode_str(path).decode_utf8().ok()?;
    Some(decoded.into_owned())
}

/// Directory shown in titles of the form `user@host: path`.
pub fn title_directory(title: &str) -> Option<String> {
    let (who, path) = title.split_once(':')?;
    let who = who.trim();
    if !who.contains('@') || who.contains(char::is_whitespace) {
        return None;
    }
    let path = path.trim();
    (path.starts_with('/') || path == "~" || path.starts_with("~/")).then(|| path.to_string())
}
