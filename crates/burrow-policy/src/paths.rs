use std::path::{Component, Path, PathBuf};

use crate::Denial;

/// Lexically normalizes a path: drops `.`, folds `..` into its parent, never climbs above the root.
///
/// The filesystem is not consulted, so symlinks are not resolved.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            Component::Normal(segment) => out.push(segment),
        }
    }

    out
}

/// Returns true when `candidate` is `root` itself or lies beneath it.
///
/// Comparison is per path component, so `/srv/root-12` is not inside `/srv/root-1`.
pub fn is_within(candidate: &Path, root: &Path) -> bool {
    normalize(candidate).starts_with(normalize(root))
}

/// Detects arguments that name an absolute location on any platform.
pub fn is_absolute_like(arg: &str) -> bool {
    if arg.starts_with('/') || arg.starts_with('\\') {
        return true;
    }

    let bytes = arg.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Resolves a caller-supplied relative path against `base` and requires the result to stay in `root`.
pub fn resolve_within(base: &Path, relative: &str, root: &Path) -> Result<PathBuf, Denial> {
    if is_absolute_like(relative) {
        return Err(Denial::AbsolutePath(relative.to_string()));
    }
    if relative.starts_with('~') {
        return Err(Denial::HomeExpansion(relative.to_string()));
    }
    if !is_within(base, root) {
        return Err(Denial::OutsideSandbox);
    }

    let candidate = normalize(&base.join(relative));
    if is_within(&candidate, root) {
        Ok(candidate)
    } else {
        Err(Denial::EscapesSandbox)
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{is_absolute_like, is_within, normalize, resolve_within};
    use crate::Denial;

    #[test]
    fn normalize_folds_dots_without_touching_disk() {
        assert_eq!(
            normalize(Path::new("/proj/abc/./sub/../lib")),
            PathBuf::from("/proj/abc/lib")
        );
        assert_eq!(normalize(Path::new("/../../etc")), PathBuf::from("/etc"));
        assert_eq!(normalize(Path::new("a/../../b")), PathBuf::from("../b"));
    }

    #[test]
    fn containment_is_component_aware() {
        let root = Path::new("/srv/projects/root-1");
        assert!(is_within(Path::new("/srv/projects/root-1"), root));
        assert!(is_within(Path::new("/srv/projects/root-1/src"), root));
        assert!(!is_within(Path::new("/srv/projects/root-12"), root));
        assert!(!is_within(Path::new("/srv/projects"), root));
        assert!(!is_within(Path::new("/srv/projects/root-1/../root-2"), root));
    }

    #[test]
    fn absolute_detection_covers_drive_letters() {
        assert!(is_absolute_like("/etc"));
        assert!(is_absolute_like("\\\\server\\share"));
        assert!(is_absolute_like("C:\\Windows"));
        assert!(is_absolute_like("d:/data"));
        assert!(!is_absolute_like("src"));
        assert!(!is_absolute_like("../x"));
    }

    #[test]
    fn resolve_within_rejects_escapes() {
        let root = Path::new("/proj/abc");
        assert_eq!(
            resolve_within(Path::new("/proj/abc/sub"), "..", root),
            Ok(PathBuf::from("/proj/abc"))
        );
        assert_eq!(
            resolve_within(root, "../../etc", root),
            Err(Denial::EscapesSandbox)
        );
        assert_eq!(
            resolve_within(root, "../abc-2", root),
            Err(Denial::EscapesSandbox)
        );
        assert_eq!(
            resolve_within(Path::new("/proj"), "abc", root),
            Err(Denial::OutsideSandbox)
        );
    }
}
