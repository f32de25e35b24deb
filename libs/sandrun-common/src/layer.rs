//! Filesystem layer descriptors
//!
//! A layer is a declarative description of content that is overlaid onto a
//! job's root filesystem. Layers are built once per run and shared by
//! reference (`LayerRef`) across every job spec.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Path remapping rules applied to every file a glob layer matches
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrefixOptions {
    /// Resolve symlinks in the source path before matching
    #[serde(default)]
    pub canonicalize: bool,
    /// Include symlinked targets when expanding the glob
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default)]
    pub strip_prefix: Option<String>,
    #[serde(default)]
    pub prepend_prefix: Option<String>,
}

impl PrefixOptions {
    /// Compute the in-container path for a matched file
    pub fn remap(&self, path: &str) -> PathBuf {
        remap_path(
            path,
            self.strip_prefix.as_deref().unwrap_or(""),
            self.prepend_prefix.as_deref().unwrap_or(""),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layer {
    /// Files selected by a glob pattern, relative to the project directory
    Glob {
        pattern: String,
        prefix_options: PrefixOptions,
    },
    /// Empty placeholders; a trailing `/` declares a directory
    Stubs { stubs: BTreeSet<String> },
}

impl Layer {
    pub fn glob(pattern: impl Into<String>, prefix_options: PrefixOptions) -> Self {
        Layer::Glob {
            pattern: pattern.into(),
            prefix_options,
        }
    }

    pub fn stubs<I, S>(stubs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Layer::Stubs {
            stubs: stubs.into_iter().map(Into::into).collect(),
        }
    }
}

/// Strip `strip_prefix` from `path` when it matches, then prepend
/// `prepend_prefix`. Either prefix may be empty, in which case that step is a
/// no-op.
pub fn remap_path(path: &str, strip_prefix: &str, prepend_prefix: &str) -> PathBuf {
    let rest = path.strip_prefix(strip_prefix).unwrap_or(path);
    if prepend_prefix.is_empty() {
        return PathBuf::from(rest);
    }
    Path::new(prepend_prefix).join(rest.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remap_strip_then_prepend() {
        let p = remap_path(
            "sandrun_venv/lib/python3.12/site-packages/pytest/__init__.py",
            "sandrun_venv/",
            "/usr/local/",
        );
        assert_eq!(
            p,
            PathBuf::from("/usr/local/lib/python3.12/site-packages/pytest/__init__.py")
        );
    }

    #[test]
    fn test_remap_empty_strip_is_noop() {
        let p = remap_path("tests/test_math.py", "", "/work");
        assert_eq!(p, PathBuf::from("/work/tests/test_math.py"));
    }

    #[test]
    fn test_remap_empty_prepend_is_noop() {
        let p = remap_path("venv/lib/x.py", "venv/", "");
        assert_eq!(p, PathBuf::from("lib/x.py"));
    }

    #[test]
    fn test_remap_both_empty_is_identity() {
        assert_eq!(remap_path("a/b.py", "", ""), PathBuf::from("a/b.py"));
    }

    #[test]
    fn test_remap_non_matching_strip_is_ignored() {
        let p = remap_path("src/app.py", "venv/", "/work");
        assert_eq!(p, PathBuf::from("/work/src/app.py"));
    }

    #[test]
    fn test_remap_strip_without_trailing_slash() {
        let p = remap_path("venv/lib/x.py", "venv", "/usr/local");
        assert_eq!(p, PathBuf::from("/usr/local/lib/x.py"));
    }

    #[test]
    fn test_prefix_options_remap() {
        let opts = PrefixOptions {
            prepend_prefix: Some("/work".to_string()),
            ..Default::default()
        };
        assert_eq!(opts.remap("x.pyc"), PathBuf::from("/work/x.pyc"));
    }

    #[test]
    fn test_stub_layers_compare_by_content() {
        let a = Layer::stubs(["/tmp/", "/dev/null"]);
        let b = Layer::stubs(["/dev/null", "/tmp/"]);
        assert_eq!(a, b);
    }
}
