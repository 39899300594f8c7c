use crate::namespace::NamespaceError;

pub const PATH_SEPARATOR: char = '/';

///
/// Width of the counter appended to sequential node names.
///
pub const SEQUENCE_WIDTH: usize = 10;

///
/// Joins `child` under `parent`, tolerating missing or doubled separators.
///
/// ```
/// use rust_etcd_recipes::paths::make_path;
///
/// assert_eq!(make_path("/locks", "a"), "/locks/a");
/// assert_eq!(make_path("/locks/", "/a"), "/locks/a");
/// assert_eq!(make_path("/", "a"), "/a");
/// ```
pub fn make_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches(PATH_SEPARATOR);
    let child = child.trim_start_matches(PATH_SEPARATOR);
    match (parent.is_empty(), child.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{child}"),
        (false, true) => ensure_leading_slash(parent),
        (false, false) => format!("{}/{child}", ensure_leading_slash(parent)),
    }
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with(PATH_SEPARATOR) {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

///
/// Splits a path into its parent path and its last segment.
///
/// The parent of a top-level node is `/`. The root has no parent and yields `("/", "")`.
///
pub fn split_path(path: &str) -> (String, String) {
    match path.rfind(PATH_SEPARATOR) {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(i) => (path[..i].to_string(), path[i + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

pub fn node_from_path(path: &str) -> String {
    split_path(path).1
}

pub fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        None
    } else {
        Some(split_path(path).0)
    }
}

///
/// Prefix every immediate child key of `path` starts with.
///
pub fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

///
/// Checks the path is absolute, has no empty segment, no trailing slash, and no relative segment.
///
pub fn validate_path(path: &str) -> Result<(), NamespaceError> {
    let invalid = |reason| {
        Err(NamespaceError::InvalidPath {
            path: path.to_string(),
            reason,
        })
    };
    if path.is_empty() {
        return invalid("path must not be empty");
    }
    if !path.starts_with(PATH_SEPARATOR) {
        return invalid("path must start with /");
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with(PATH_SEPARATOR) {
        return invalid("path must not end with /");
    }
    for segment in path[1..].split(PATH_SEPARATOR) {
        if segment.is_empty() {
            return invalid("empty node name");
        }
        if segment == "." || segment == ".." {
            return invalid("relative paths are not allowed");
        }
        if segment.contains('\0') {
            return invalid("null character in node name");
        }
    }
    Ok(())
}

///
/// Every ancestor of `path` from the top-level one down to its parent, excluding the root.
///
pub fn ancestors(path: &str) -> Vec<String> {
    let mut acc = Vec::new();
    let mut current = String::new();
    let segments: Vec<&str> = path
        .split(PATH_SEPARATOR)
        .filter(|s| !s.is_empty())
        .collect();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        current.push(PATH_SEPARATOR);
        current.push_str(segment);
        acc.push(current.clone());
    }
    acc
}

///
/// Sequence number of a sequential node name, taken from its trailing digits.
///
pub fn sequence_of(name: &str) -> Option<u64> {
    if name.len() < SEQUENCE_WIDTH {
        return None;
    }
    let suffix = &name[name.len() - SEQUENCE_WIDTH..];
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

pub fn format_sequence(path: &str, sequence: u64) -> String {
    format!("{path}{sequence:0width$}", width = SEQUENCE_WIDTH)
}

///
/// Roots `path` under a client namespace. An empty namespace leaves the path untouched.
///
pub fn fix_for_namespace(namespace: &str, path: &str) -> String {
    if namespace.is_empty() || namespace == "/" {
        path.to_string()
    } else {
        make_path(namespace, path)
    }
}

///
/// Inverse of [`fix_for_namespace`].
///
pub fn unfix_for_namespace(namespace: &str, path: &str) -> String {
    if namespace.is_empty() || namespace == "/" {
        return path.to_string();
    }
    let namespace = ensure_leading_slash(namespace.trim_end_matches(PATH_SEPARATOR));
    match path.strip_prefix(namespace.as_str()) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with(PATH_SEPARATOR) => rest.to_string(),
        _ => path.to_string(),
    }
}

///
/// Sorts sibling names by sequence number, names without a sequence last.
///
pub fn sort_by_sequence(names: &mut [String]) {
    names.sort_by(|a, b| {
        let sa = sequence_of(a).unwrap_or(u64::MAX);
        let sb = sequence_of(b).unwrap_or(u64::MAX);
        sa.cmp(&sb).then_with(|| a.cmp(b))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_should_return_parent_and_node() {
        assert_eq!(
            split_path("/sample/sub1/sub2/sub3"),
            ("/sample/sub1/sub2".to_string(), "sub3".to_string())
        );
        assert_eq!(split_path("/a"), ("/".to_string(), "a".to_string()));
        assert_eq!(node_from_path("/sample/sub1/sub1-1/sub1-1-1"), "sub1-1-1");
        assert_eq!(parent_of("/"), None);
        assert_eq!(parent_of("/a/b").as_deref(), Some("/a"));
    }

    #[test]
    fn validate_path_should_reject_malformed_paths() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/a/b-0000000001").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("a/b").is_err());
        assert!(validate_path("/a/").is_err());
        assert!(validate_path("/a//b").is_err());
        assert!(validate_path("/a/../b").is_err());
    }

    #[test]
    fn ancestors_should_exclude_root_and_self() {
        assert_eq!(ancestors("/a/b/c"), vec!["/a".to_string(), "/a/b".to_string()]);
        assert!(ancestors("/a").is_empty());
        assert!(ancestors("/").is_empty());
    }

    #[test]
    fn sequence_should_be_parsed_from_trailing_digits() {
        let name = node_from_path(&format_sequence("/locks/_c_abc-lock-", 80));
        assert_eq!(name, "_c_abc-lock-0000000080");
        assert_eq!(sequence_of(&name), Some(80));
        assert_eq!(sequence_of("ready"), None);
        assert_eq!(sequence_of("lock-00000000x1"), None);
    }

    #[test]
    fn sort_by_sequence_should_ignore_name_prefixes() {
        let mut names = vec![
            "zzz-lock-0000000003".to_string(),
            "aaa-lock-0000000007".to_string(),
            "mmm-lock-0000000001".to_string(),
        ];
        sort_by_sequence(&mut names);
        assert_eq!(
            names,
            vec![
                "mmm-lock-0000000001".to_string(),
                "zzz-lock-0000000003".to_string(),
                "aaa-lock-0000000007".to_string(),
            ]
        );
    }

    #[test]
    fn namespace_should_round_trip() {
        assert_eq!(fix_for_namespace("/app", "/sub2"), "/app/sub2");
        assert_eq!(fix_for_namespace("app", "/"), "/app");
        assert_eq!(unfix_for_namespace("/app", "/app/sub2"), "/sub2");
        assert_eq!(unfix_for_namespace("/app", "/app"), "/");
        assert_eq!(unfix_for_namespace("/app", "/application"), "/application");
        assert_eq!(fix_for_namespace("", "/x"), "/x");
    }
}
