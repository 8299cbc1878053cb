//! Normalize, split, and join POSIX-like paths.
//!
//! Two representations are used throughout campusfs: a plain `/`-joined
//! `String` (what the kernel and templates speak) and a `Vec<String>` of
//! already-split segments (what the VP/RP trees keep around to avoid
//! re-splitting on every lookup). `head`/`tail`/`parent`/`name` are defined
//! for both and must agree.

/// Collapse `.`/`..`, strip leading/trailing separators. An all-`.`/empty
/// path normalizes to the empty string.
pub fn normalize(path: &str) -> String {
    join(&normalize_segments(&split(path)))
}

/// Split a path on `/`, dropping empty segments and `.`, but not resolving
/// `..` (use [`normalize_segments`] for that).
pub fn split(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .map(str::to_owned)
        .collect()
}

/// Resolve `..` within an already-split segment sequence.
pub fn normalize_segments(segments: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(segments.len());
    for seg in segments {
        if seg == ".." {
            out.pop();
        } else if !seg.is_empty() && seg != "." {
            out.push(seg.clone());
        }
    }
    out
}

/// Join segments back into a `/`-separated path, empty input yields `""`.
pub fn join(segments: &[String]) -> String {
    segments.join("/")
}

/// First segment of a path, or `""` if the path is empty.
pub fn head(path: &str) -> String {
    split(path).into_iter().next().unwrap_or_default()
}

/// First segment of a segment sequence.
pub fn head_seg(segments: &[String]) -> Option<&String> {
    segments.first()
}

/// Everything after the first segment.
pub fn tail(path: &str) -> String {
    let segs = split(path);
    join(segs.get(1..).unwrap_or_default())
}

/// Everything after the first segment, as a sequence.
pub fn tail_seg(segments: &[String]) -> Vec<String> {
    segments.get(1..).unwrap_or_default().to_vec()
}

/// All but the last segment.
pub fn parent(path: &str) -> String {
    let segs = split(path);
    if segs.is_empty() {
        String::new()
    } else {
        join(&segs[..segs.len() - 1])
    }
}

/// The last segment, or `""` if the path is empty.
pub fn name(path: &str) -> String {
    split(path).into_iter().last().unwrap_or_default()
}

/// Case rules for [`eq`]: case-sensitive everywhere except Windows, per
/// spec.md §4.7's `resolve` rule.
pub fn eq(a: &str, b: &str) -> bool {
    if cfg!(windows) {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_parent_name_roundtrip() {
        for p in ["a/b/c", "a", "a/b", "/a/b/c/", "a//b"] {
            let n = normalize(p);
            if n.is_empty() {
                continue;
            }
            assert_eq!(join(&[parent(&n), name(&n)]), n.clone(), "p={p}");
        }
    }

    #[test]
    fn normalize_collapses_dotdot() {
        assert_eq!(normalize("a/../b"), normalize("b"));
        assert_eq!(normalize("a/b/../../c"), "c");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("."), "");
        assert_eq!(normalize("///"), "");
    }

    #[test]
    fn head_tail_agree_across_representations() {
        let p = "a/b/c";
        let segs = split(p);
        assert_eq!(head(p), *head_seg(&segs).unwrap());
        assert_eq!(tail(p), join(&tail_seg(&segs)));
    }

    #[test]
    fn eq_is_case_sensitive_off_windows() {
        if !cfg!(windows) {
            assert!(!eq("Algo", "algo"));
        }
    }
}
