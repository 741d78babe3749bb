use std::fmt;

use super::remote;
use super::scan::PathCandidates;

/// Where a resolved directory came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathSource {
    Prompt,
    PwdOutput,
    CdCommand,
    ParentOfCd,
    ReconstructedFromCd,
    RelativeCd,
    LastKnown,
    HomeDir,
    Default,
}

impl fmt::Display for PathSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Prompt => "prompt",
            Self::PwdOutput => "pwd output",
            Self::CdCommand => "cd command",
            Self::ParentOfCd => "parent of cd",
            Self::ReconstructedFromCd => "reconstructed from cd",
            Self::RelativeCd => "relative cd",
            Self::LastKnown => "last known path",
            Self::HomeDir => "home directory",
            Self::Default => "default",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Resolved { path: String, source: PathSource },
    Unresolved,
}

impl Resolution {
    fn resolved(path: impl Into<String>, source: PathSource) -> Self {
        Self::Resolved {
            path: path.into(),
            source,
        }
    }
}

/// Durable knowledge about the session the scrollback belongs to.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResolveContext<'a> {
    pub last_known: Option<&'a str>,
    pub home: Option<&'a str>,
}

enum PromptCheck {
    Matches,
    Mismatch,
    /// `~` style prompt while the home directory is unknown.
    Unverifiable,
}

/// Picks a directory from scrollback evidence, in strict priority order:
/// absolute prompt, pwd output, verified absolute `cd`, inference from a
/// contradicted `cd`, then relative `cd`s against durable state.
pub fn resolve(found: &PathCandidates, ctx: ResolveContext<'_>) -> Resolution {
    if let Some(prompt) = found.prompt.as_deref() {
        if remote::is_absolute(prompt) {
            return Resolution::resolved(remote::normalize(prompt), PathSource::Prompt);
        }
        if let Some(expanded) = remote::expand_home(prompt, ctx.home) {
            return Resolution::resolved(expanded, PathSource::Prompt);
        }
    }

    if let Some(pwd) = found.pwd_output.as_deref() {
        return Resolution::resolved(remote::normalize(pwd), PathSource::PwdOutput);
    }

    if let Some(cd) = found.absolute_cd.as_deref() {
        let cd = remote::normalize(cd);
        match check_prompt(&cd, found.prompt.as_deref()) {
            None if !found.has_recent_relative_cd() => {
                return Resolution::resolved(cd, PathSource::CdCommand);
            }
            None => {
                if let Some(path) = fold(&cd, &found.relative_cds, ctx.home) {
                    return Resolution::resolved(path, PathSource::ReconstructedFromCd);
                }
            }
            Some(PromptCheck::Matches) => {
                return Resolution::resolved(cd, PathSource::CdCommand);
            }
            Some(PromptCheck::Mismatch) => {
                // The prompt contradicts the cd: something relative happened since.
                let prompt = found.prompt.as_deref().map(remote::base_name).unwrap_or("");
                if let Some(resolution) = infer_from_cd(&cd, prompt, found, ctx.home) {
                    return resolution;
                }
            }
            Some(PromptCheck::Unverifiable) => {}
        }
    }

    if found.has_recent_relative_cd() {
        let base = ctx.last_known.or(ctx.home);
        if let Some(path) = fold_from(base, &found.relative_cds, ctx.home) {
            return Resolution::resolved(path, PathSource::RelativeCd);
        }
    }

    Resolution::Unresolved
}

/// Last resort once scrollback gave nothing usable.
pub fn fallback(ctx: ResolveContext<'_>) -> Resolution {
    if let Some(path) = ctx.last_known {
        return Resolution::resolved(path, PathSource::LastKnown);
    }
    if let Some(home) = ctx.home {
        return Resolution::resolved(home, PathSource::HomeDir);
    }
    Resolution::resolved(".", PathSource::Default)
}

fn check_prompt(cd: &str, prompt: Option<&str>) -> Option<PromptCheck> {
    let prompt = prompt?;
    if prompt == "~" || prompt.starts_with("~/") {
        // An expandable `~` prompt was already taken as absolute.
        return Some(PromptCheck::Unverifiable);
    }
    if remote::base_name(cd) == remote::base_name(prompt) {
        Some(PromptCheck::Matches)
    } else {
        Some(PromptCheck::Mismatch)
    }
}

fn infer_from_cd(
    cd: &str,
    prompt: &str,
    found: &PathCandidates,
    home: Option<&str>,
) -> Option<Resolution> {
    // `cd /a/b` then `cd ..` shows up as a prompt named after the parent.
    let parent = remote::parent(cd);
    if remote::base_name(&parent) == prompt {
        return Some(Resolution::resolved(parent, PathSource::ParentOfCd));
    }

    if found.has_recent_relative_cd() {
        if let Some(folded) = fold(cd, &found.relative_cds, home) {
            if remote::base_name(&folded) == prompt {
                return Some(Resolution::resolved(folded, PathSource::ReconstructedFromCd));
            }
        }
    }

    if let Some(ancestor) = ancestor_named(cd, prompt) {
        return Some(Resolution::resolved(ancestor, PathSource::ReconstructedFromCd));
    }

    if !found.has_recent_relative_cd() || found.relative_cd() == Some("..") {
        return Some(Resolution::resolved(parent, PathSource::ParentOfCd));
    }

    None
}

/// Nearest proper ancestor of `path` whose last segment is `name`.
fn ancestor_named(path: &str, name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let count = segments.len().checked_sub(1)?;
    let idx = segments[..count].iter().rposition(|s| *s == name)?;
    Some(format!("/{}", segments[..=idx].join("/")))
}

fn fold(start: &str, targets: &[String], home: Option<&str>) -> Option<String> {
    fold_from(Some(start), targets, home)
}

fn fold_from(start: Option<&str>, targets: &[String], home: Option<&str>) -> Option<String> {
    let mut cwd = start.map(str::to_string);
    for target in targets {
        cwd = Some(remote::apply_cd(cwd.as_deref(), target, home)?);
    }
    cwd.filter(|p| remote::is_absolute(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_inference::scan::{scan, DEFAULT_SCAN_LINES};

    fn resolve_lines(lines: &[&str], ctx: ResolveContext<'_>) -> Resolution {
        resolve(&scan(lines, DEFAULT_SCAN_LINES), ctx)
    }

    fn path(resolution: &Resolution) -> Option<&str> {
        match resolution {
            Resolution::Resolved { path, .. } => Some(path),
            Resolution::Unresolved => None,
        }
    }

    #[test]
    fn verified_cd_wins() {
        let lines = ["[root@host ~]# cd /var/www/web", "[root@host web]# "];
        let res = resolve_lines(&lines, ResolveContext::default());
        assert_eq!(
            res,
            Resolution::Resolved {
                path: "/var/www/web".into(),
                source: PathSource::CdCommand
            }
        );
    }

    #[test]
    fn mismatched_prompt_falls_back_to_parent() {
        let lines = ["[root@host ~]# cd /var/www/web", "[root@host local]# "];
        let res = resolve_lines(&lines, ResolveContext::default());
        assert_ne!(path(&res), Some("/var/www/web"));
        assert_eq!(path(&res), Some("/var/www"));
    }

    #[test]
    fn parent_match_after_cd_up() {
        let lines = [
            "[root@host ~]# cd /var/www/web",
            "[root@host web]# cd ..",
            "[root@host www]# ",
        ];
        let res = resolve_lines(&lines, ResolveContext::default());
        assert_eq!(
            res,
            Resolution::Resolved {
                path: "/var/www".into(),
                source: PathSource::ParentOfCd
            }
        );
    }

    #[test]
    fn relative_chain_is_replayed_on_the_cd() {
        let lines = [
            "[root@host ~]# cd /srv",
            "[root@host srv]# cd app",
            "[root@host app]# cd logs",
            "[root@host logs]# ",
        ];
        let res = resolve_lines(&lines, ResolveContext::default());
        assert_eq!(path(&res), Some("/srv/app/logs"));
    }

    #[test]
    fn truncates_at_ancestor_named_like_prompt() {
        let lines = [
            "dev@box:~$ cd /opt/stack/service/bin",
            "dev@box:~$ cd -",
            "dev@box:stack$ ",
        ];
        let res = resolve_lines(&lines, ResolveContext::default());
        assert_eq!(path(&res), Some("/opt/stack"));
    }

    #[test]
    fn absolute_prompt_beats_everything() {
        let lines = ["/tmp/build/out", "dev@box:/etc/nginx$ cd /var", "dev@box:/var$ "];
        let res = resolve_lines(&lines, ResolveContext::default());
        assert_eq!(
            res,
            Resolution::Resolved {
                path: "/var".into(),
                source: PathSource::Prompt
            }
        );
    }

    #[test]
    fn home_prompt_needs_known_home() {
        let lines = ["dev@box:~/src$ "];
        let known = resolve_lines(
            &lines,
            ResolveContext {
                last_known: None,
                home: Some("/home/dev"),
            },
        );
        assert_eq!(path(&known), Some("/home/dev/src"));
        assert_eq!(resolve_lines(&lines, ResolveContext::default()), Resolution::Unresolved);
    }

    #[test]
    fn pwd_output_beats_cd() {
        let lines = ["[u@h ~]# cd /a/b", "[u@h b]# pwd", "/a/b/c", "[u@h c]# "];
        let res = resolve_lines(&lines, ResolveContext::default());
        assert_eq!(path(&res), Some("/a/b/c"));
    }

    #[test]
    fn relative_cd_uses_last_known() {
        let lines = ["[u@h code]# cd ../docs", "[u@h docs]# "];
        let res = resolve_lines(
            &lines,
            ResolveContext {
                last_known: Some("/home/u/code"),
                home: Some("/home/u"),
            },
        );
        assert_eq!(
            res,
            Resolution::Resolved {
                path: "/home/u/docs".into(),
                source: PathSource::RelativeCd
            }
        );
    }

    #[test]
    fn fallback_chain() {
        assert_eq!(
            fallback(ResolveContext {
                last_known: Some("/srv"),
                home: Some("/root")
            }),
            Resolution::Resolved {
                path: "/srv".into(),
                source: PathSource::LastKnown
            }
        );
        assert_eq!(
            fallback(ResolveContext {
                last_known: None,
                home: Some("/root")
            }),
            Resolution::Resolved {
                path: "/root".into(),
                source: PathSource::HomeDir
            }
        );
        assert_eq!(
            fallback(ResolveContext::default()),
            Resolution::Resolved {
                path: ".".into(),
                source: PathSource::Default
            }
        );
    }

    #[test]
    fn garbage_never_panics() {
        let lines = ["\u{1b}[0m", "cd", "[@ ]#", "/", "@:$", "cd ../../../../.."];
        let _ = resolve_lines(&lines, ResolveContext::default());
        let _ = resolve_lines(
            &lines,
            ResolveContext {
                last_known: Some("/"),
                home: None,
            },
        );
    }
}
