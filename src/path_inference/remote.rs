//! String helpers for remote (always `/`-separated) paths.

pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

pub fn join(base: &str, name: &str) -> String {
    let base = base.trim();
    let name = name.trim();
    if name.is_empty() {
        return base.to_string();
    }
    if name.starts_with('/') {
        return name.to_string();
    }
    if base.is_empty() || base == "." {
        return name.to_string();
    }
    if base == "/" {
        return format!("/{name}");
    }
    format!("{}/{}", base.trim_end_matches('/'), name)
}

pub fn parent(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == "." || path == "/" {
        return "/".to_string();
    }
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    }
}

/// Last non-empty segment; `/` for the root itself.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Collapses `.`, `..` and repeated slashes of an absolute path. `..` at the
/// root stays at the root.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Expands a leading `~` when the home directory is known.
pub fn expand_home(path: &str, home: Option<&str>) -> Option<String> {
    let home = home.filter(|h| is_absolute(h))?;
    if path == "~" {
        return Some(normalize(home));
    }
    let rest = path.strip_prefix("~/")?;
    Some(normalize(&join(home, rest)))
}

/// Applies one `cd` argument to `cwd`. `None` when it cannot be known, e.g.
/// `cd -` or `~` without a home directory.
pub fn apply_cd(cwd: Option<&str>, target: &str, home: Option<&str>) -> Option<String> {
    let target = target.trim();
    match target {
        "-" => None,
        "" | "~" => expand_home("~", home),
        t if t.starts_with("~/") => expand_home(t, home),
        t if is_absolute(t) => Some(normalize(t)),
        t => {
            let cwd = cwd.filter(|c| is_absolute(c))?;
            Some(normalize(&join(cwd, t)))
        }
    }
}

/// Directory the upload should land in, in the form the transfer layer expects.
///
/// `~` is expanded when the home is known and otherwise made home-relative,
/// which is how SFTP resolves relative paths. A relative directory is anchored
/// on `last_known` when there is one.
pub fn upload_dir(dir: &str, last_known: Option<&str>, home: Option<&str>) -> String {
    let dir = dir.trim();
    if dir == "~" || dir.starts_with("~/") {
        if let Some(expanded) = expand_home(dir, home) {
            return expanded;
        }
        let rest = dir.trim_start_matches('~').trim_start_matches('/');
        return if rest.is_empty() {
            ".".to_string()
        } else {
            rest.to_string()
        };
    }
    if is_absolute(dir) {
        return normalize(dir);
    }
    match last_known.filter(|p| is_absolute(p)) {
        Some(base) => normalize(&join(base, dir)),
        None if dir.is_empty() => ".".to_string(),
        None => dir.to_string(),
    }
}
