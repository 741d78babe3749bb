use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_SCAN_LINES: usize = 50;

/// `cd` somewhere in a command line, optionally chained with `;`, `&&` or `|`.
static CD_COMMAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:^|[\s;&|#$%>])cd(?:\s+([^\s;&|]+))?\s*(?:$|[;&|])"#)
        .expect("cd regex")
});

/// `[user@host path]#` or `$`
static CENTOS_PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[[^\s@\]]+@[^\s\]]+\s+([^\]]+?)\]\s*[#$]")
        .expect("centos prompt regex")
});

/// `user@host:path$` or `#`
static UBUNTU_PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^\s@:\[]+@[^\s:\]]+:([^\s$#]*)\s*[$#]")
        .expect("ubuntu prompt regex")
});

/// `user@host path %`
static ZSH_PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^\s@\[]+@[^\s:\]]+\s+(\S+)\s*%")
        .expect("zsh prompt regex")
});

/// Evidence extracted from scrollback, most recent first per kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathCandidates {
    /// Path fragment of the most recent prompt (`web`, `~`, `/var/www`).
    pub prompt: Option<String>,
    /// Most recent line shaped like `pwd` output.
    pub pwd_output: Option<String>,
    /// Most recent absolute `cd` target.
    pub absolute_cd: Option<String>,
    /// Relative `cd` targets issued after `absolute_cd`, oldest first.
    pub relative_cds: Vec<String>,
}

impl PathCandidates {
    pub fn has_recent_relative_cd(&self) -> bool {
        !self.relative_cds.is_empty()
    }

    /// The most recent relative target, if any.
    pub fn relative_cd(&self) -> Option<&str> {
        self.relative_cds.last().map(String::as_str)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineEvidence {
    Cd(String),
    Pwd(String),
    Prompt(String),
}

/// Walks `lines` (oldest first, as they appear on screen) from the bottom up,
/// looking at no more than `limit` non-blank lines.
pub fn scan<S: AsRef<str>>(lines: &[S], limit: usize) -> PathCandidates {
    let mut found = PathCandidates::default();
    let mut relative_newest_first = Vec::new();

    let recent = lines
        .iter()
        .rev()
        .map(|l| l.as_ref().trim_end())
        .filter(|l| !l.trim().is_empty())
        .take(limit);

    for line in recent {
        match classify(line) {
            Some(LineEvidence::Cd(target)) => {
                if found.absolute_cd.is_some() {
                    continue;
                }
                if target.starts_with('/') {
                    found.absolute_cd = Some(target);
                } else {
                    relative_newest_first.push(target);
                }
            }
            Some(LineEvidence::Pwd(path)) => {
                found.pwd_output.get_or_insert(path);
            }
            Some(LineEvidence::Prompt(fragment)) => {
                found.prompt.get_or_insert(fragment);
            }
            None => {}
        }
    }

    relative_newest_first.reverse();
    found.relative_cds = relative_newest_first;
    found
}

fn classify(line: &str) -> Option<LineEvidence> {
    if let Some(target) = cd_target(line) {
        return Some(LineEvidence::Cd(target));
    }
    if is_pwd_output(line) {
        return Some(LineEvidence::Pwd(line.trim().to_string()));
    }
    prompt_fragment(line).map(LineEvidence::Prompt)
}

/// Target of the last `cd` on the line. Bare `cd` means `~`.
pub fn cd_target(line: &str) -> Option<String> {
    let caps = CD_COMMAND.captures_iter(line).last()?;
    let target = caps
        .get(1)
        .map(|m| strip_quotes(m.as_str()))
        .filter(|t| !t.is_empty())
        .unwrap_or("~");
    Some(target.to_string())
}

fn strip_quotes(s: &str) -> &str {
    s.trim_matches(|c| c == '"' || c == '\'')
}

pub fn is_pwd_output(line: &str) -> bool {
    let line = line.trim();
    line.starts_with('/')
        && line[1..].contains('/')
        && !line
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '[' | ']' | '(' | ')' | '{' | '}' | '@'))
}

pub fn prompt_fragment(line: &str) -> Option<String> {
    [&*CENTOS_PROMPT, &*UBUNTU_PROMPT, &*ZSH_PROMPT]
        .into_iter()
        .find_map(|re| re.captures(line))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|fragment| !fragment.is_empty())
}
