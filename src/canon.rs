//! Path canonicalization.
//!
//! Node names in the build graph are compared as strings, so every path a
//! producer hands us is run through `canon_path` first.

/// Lexically canonicalize a path, removing redundant components.
/// Does not access the disk, but only simplifies things like
/// "foo/./bar" => "foo/bar" or "a/b/../c" => "a/c".
/// A trailing slash is dropped.
pub fn canon_path<T: AsRef<str>>(inpath: T) -> String {
    let path = inpath.as_ref();
    let absolute = path.starts_with('/');
    // Components that can still be cancelled by a "..".
    let mut parts: Vec<&str> = Vec::new();
    // Leading ".." components of a relative path, which cannot be.
    let mut ups = 0usize;
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() && !absolute {
                    ups += 1;
                }
            }
            _ => parts.push(component),
        }
    }

    let mut out = String::with_capacity(path.len());
    if absolute {
        out.push('/');
    }
    for _ in 0..ups {
        out.push_str("../");
    }
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(part);
    }
    if out.ends_with('/') && out.len() > 1 {
        out.pop();
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

/// Joins `rel` onto `base` unless it is already absolute, then canonicalizes.
pub fn join<B: AsRef<str>, R: AsRef<str>>(base: B, rel: R) -> String {
    let rel = rel.as_ref();
    if rel.starts_with('/') {
        return canon_path(rel);
    }
    canon_path(format!("{}/{}", base.as_ref(), rel))
}

/// The directory portion of a canonical path, if any.
pub fn parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// The last component of a path.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Whether `path` is `dir` or lies somewhere beneath it.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path.starts_with('/');
    }
    path == dir || (path.starts_with(dir) && path.as_bytes().get(dir.len()) == Some(&b'/'))
}
