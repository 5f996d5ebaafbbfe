//! Human-readable status lines for nodes.
//!
//! A build line is `name << sources >> targets`; a clear line shows only the
//! targets. In `brief` mode individual arguments are truncated at 64
//! characters, file paths shrink to their basename and long argument lists
//! collapse to `first ... last` once the joined length passes 128 characters.
//! These strings are for reporting only; nothing parses them.

use crate::entity::Entity;
use std::path::PathBuf;

const BRIEF_ARG_LEN: usize = 64;
const FULL_ARG_LEN: usize = 256;
const WISH_LINE_LEN: usize = 128;

/// One argument of a status line.
#[derive(Clone, Debug)]
pub enum StrArg {
    Path(PathBuf),
    Text(String),
}

impl StrArg {
    /// The printable form of an entity, if it has one.
    pub fn from_entity(entity: &Entity) -> Option<StrArg> {
        if let Some(path) = entity.path() {
            return Some(StrArg::Path(path.to_path_buf()));
        }
        match entity {
            Entity::Simple { data: Some(data), .. } => {
                std::str::from_utf8(data).ok().map(|s| StrArg::Text(s.to_string()))
            }
            _ => None,
        }
    }
}

impl From<&str> for StrArg {
    fn from(s: &str) -> Self {
        StrArg::Text(s.to_string())
    }
}

impl From<String> for StrArg {
    fn from(s: String) -> Self {
        StrArg::Text(s)
    }
}

impl From<PathBuf> for StrArg {
    fn from(p: PathBuf) -> Self {
        StrArg::Path(p)
    }
}

/// The three parts of a status line, as provided by the builder.
#[derive(Clone, Debug, Default)]
pub struct BuildStrArgs {
    pub name: Vec<StrArg>,
    pub sources: Vec<StrArg>,
    pub targets: Vec<StrArg>,
}

/// Formats the full `name << sources >> targets` line.
pub fn build_str(args: &BuildStrArgs, brief: bool) -> String {
    let name = join_args(&args.name, brief);
    let sources = join_args(&args.sources, brief);
    let targets = join_args(&args.targets, brief);

    let mut line = name;
    if !sources.is_empty() {
        line.push_str(" << ");
        line.push_str(&sources);
    }
    if !targets.is_empty() {
        line.push_str(" >> ");
        line.push_str(&targets);
    }
    line
}

/// Formats the targets-only line used when cleaning.
pub fn clear_str(args: &BuildStrArgs, brief: bool) -> String {
    join_args(&args.targets, brief)
}

fn trace_arg(arg: &StrArg, brief: bool) -> Option<String> {
    let text = match arg {
        StrArg::Path(path) => {
            if brief {
                path.file_name().map(|n| n.to_string_lossy().into_owned())?
            } else {
                path.display().to_string()
            }
        }
        StrArg::Text(text) => {
            let mut text = text.trim().to_string();
            if let Some(pos) = text.find('\n') {
                text.truncate(pos);
            }
            let max_len = if brief { BRIEF_ARG_LEN } else { FULL_ARG_LEN };
            if text.chars().count() > max_len {
                let mut truncated: String = text.chars().take(max_len).collect();
                truncated.push_str("...");
                text = truncated;
            }
            text
        }
    };
    (!text.is_empty()).then_some(text)
}

fn join_args(args: &[StrArg], brief: bool) -> String {
    let mut parts: Vec<String> = args.iter().filter_map(|arg| trace_arg(arg, brief)).collect();

    if !brief || parts.len() < 3 {
        return parts.join(" ");
    }

    let last = parts.pop().unwrap_or_default();
    let mut joined = vec![parts.remove(0)];
    let mut size = joined[0].len() + last.len();

    for part in parts {
        size += part.len();
        if size > WISH_LINE_LEN {
            joined.push("...".to_string());
            break;
        }
        joined.push(part);
    }

    joined.push(last);
    joined.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn paths(names: &[&str]) -> Vec<StrArg> {
        names.iter().map(|n| StrArg::Path(PathBuf::from(format!("/work/{n}")))).collect()
    }

    #[test]
    fn full_line_shape() {
        let args = BuildStrArgs {
            name: vec!["cc".into()],
            sources: paths(&["a.c"]),
            targets: paths(&["a.o"]),
        };
        assert_eq!(build_str(&args, false), "cc << /work/a.c >> /work/a.o");
        assert_eq!(build_str(&args, true), "cc << a.c >> a.o");
        assert_eq!(clear_str(&args, true), "a.o");
    }

    #[test]
    fn empty_parts_are_skipped() {
        let args = BuildStrArgs { name: vec!["link".into()], ..Default::default() };
        assert_eq!(build_str(&args, true), "link");
    }

    #[test]
    fn brief_truncates_long_text() {
        let long = "x".repeat(100);
        let args = BuildStrArgs { name: vec![long.clone().into()], ..Default::default() };
        let brief = build_str(&args, true);
        assert_eq!(brief.len(), 64 + 3);
        assert!(brief.ends_with("..."));
        // full mode keeps anything up to 256 chars
        assert_eq!(build_str(&args, false), long);
    }

    #[test]
    fn text_is_cut_at_first_newline() {
        let args =
            BuildStrArgs { name: vec!["first line\nsecond line".into()], ..Default::default() };
        assert_eq!(build_str(&args, true), "first line");
    }

    #[test]
    fn brief_collapses_long_lists() {
        let names: Vec<String> = (0..20).map(|i| format!("source_file_{i:02}.c")).collect();
        let args = BuildStrArgs {
            name: vec!["cc".into()],
            sources: names.iter().map(|n| StrArg::Text(n.clone())).collect(),
            ..Default::default()
        };
        let line = build_str(&args, true);
        assert!(line.contains("..."));
        assert!(line.contains("source_file_00.c"));
        assert!(line.contains("source_file_19.c"));
        assert!(!line.contains("source_file_15.c"));
    }

    #[test]
    fn short_lists_are_joined_whole() {
        let args = BuildStrArgs {
            name: vec!["cc".into()],
            sources: paths(&["a.c", "b.c"]),
            ..Default::default()
        };
        assert_eq!(build_str(&args, true), "cc << a.c b.c");
    }
}
