//! Parameter validators for action handlers
//!
//! Every value that ends up in an argv or a file path passes through one of
//! these first. They never coerce: a value either matches exactly or the
//! request is rejected.

use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use super::protocol::{ParamValue, Params};
use super::registry::ActionError;

/// Longest string parameter accepted by any handler
pub const MAX_STRING_LEN: usize = 256;

pub const VMID_MIN: u32 = 100;
pub const VMID_MAX: u32 = 999_999_999;

static DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{1,10}$").expect("digits regex is valid"));

type Result<T> = std::result::Result<T, ActionError>;

/// Reject any key not in `allowed`
pub fn only_keys(params: &Params, allowed: &[&str]) -> Result<()> {
    let allowed: BTreeSet<&str> = allowed.iter().copied().collect();
    match params.keys().find(|k| !allowed.contains(k.as_str())) {
        Some(k) => Err(ActionError::Validation(format!("unexpected parameter: {}", truncate(k)))),
        None => Ok(()),
    }
}

pub fn require<'a>(params: &'a Params, key: &str) -> Result<&'a ParamValue> {
    params
        .get(key)
        .ok_or_else(|| ActionError::Validation(format!("{} is required", key)))
}

/// Integer parameter; a string made only of digits is also accepted
pub fn int(params: &Params, key: &str) -> Result<i64> {
    match require(params, key)? {
        ParamValue::Int(i) => Ok(*i),
        ParamValue::Str(s) if DIGITS_RE.is_match(s) => s
            .parse()
            .map_err(|_| ActionError::Validation(format!("{} out of range", key))),
        ParamValue::Str(s) => Err(ActionError::Validation(format!(
            "{} must be an integer, got '{}'",
            key,
            truncate(s)
        ))),
    }
}

pub fn optional_int(params: &Params, key: &str) -> Result<Option<i64>> {
    if params.contains_key(key) {
        int(params, key).map(Some)
    } else {
        Ok(None)
    }
}

pub fn int_in_range(params: &Params, key: &str, min: i64, max: i64) -> Result<i64> {
    let v = int(params, key)?;
    if v < min || v > max {
        return Err(ActionError::Validation(format!(
            "{} must be between {} and {}, got {}",
            key, min, max, v
        )));
    }
    Ok(v)
}

pub fn vmid(params: &Params) -> Result<u32> {
    let v = int_in_range(params, "vmid", VMID_MIN as i64, VMID_MAX as i64)?;
    u32::try_from(v).map_err(|_| ActionError::Validation("vmid out of range".into()))
}

/// String parameter with a length bound and no control characters
pub fn string<'a>(params: &'a Params, key: &str) -> Result<&'a str> {
    match require(params, key)? {
        ParamValue::Str(s) => check_string(key, s),
        ParamValue::Int(_) => Err(ActionError::Validation(format!("{} must be a string", key))),
    }
}

/// Integers are rendered to their decimal form; strings are bounds-checked
pub fn scalar_string(params: &Params, key: &str) -> Result<String> {
    match require(params, key)? {
        ParamValue::Int(i) => Ok(i.to_string()),
        ParamValue::Str(s) => check_string(key, s).map(str::to_string),
    }
}

fn check_string<'a>(key: &str, s: &'a str) -> Result<&'a str> {
    if s.is_empty() {
        return Err(ActionError::Validation(format!("{} cannot be empty", key)));
    }
    if s.len() > MAX_STRING_LEN {
        return Err(ActionError::Validation(format!(
            "{} exceeds {} bytes",
            key, MAX_STRING_LEN
        )));
    }
    if s.chars().any(char::is_control) {
        return Err(ActionError::Validation(format!("{} contains control characters", key)));
    }
    Ok(s)
}

pub fn matching<'a>(params: &'a Params, key: &str, re: &Regex) -> Result<&'a str> {
    let s = string(params, key)?;
    if !re.is_match(s) {
        return Err(ActionError::Validation(format!("invalid {}: '{}'", key, truncate(s))));
    }
    Ok(s)
}

/// Absolute path, no `..`, resolving (symlinks included) inside one of `allowed_dirs`
pub fn contained_path(params: &Params, key: &str, allowed_dirs: &[PathBuf]) -> Result<PathBuf> {
    let raw = Path::new(string(params, key)?);
    if !raw.is_absolute() {
        return Err(ActionError::Validation(format!("{} must be an absolute path", key)));
    }
    if raw.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ActionError::Validation(format!("{} must not contain '..'", key)));
    }
    let resolved = raw.canonicalize().map_err(|_| {
        ActionError::Validation(format!("{} not found: {}", key, raw.display()))
    })?;
    let inside = allowed_dirs
        .iter()
        .filter_map(|d| d.canonicalize().ok())
        .any(|d| resolved.starts_with(d));
    if !inside {
        return Err(ActionError::Validation(format!(
            "{} must be under one of: {}",
            key,
            allowed_dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    Ok(resolved)
}

/// Cut attacker-supplied text before it is echoed back or logged
fn truncate(s: &str) -> String {
    const LIMIT: usize = 64;
    if s.len() <= LIMIT {
        return s.to_string();
    }
    let mut end = LIMIT;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, ParamValue)]) -> Params {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_vmid_bounds() {
        assert_eq!(vmid(&params(&[("vmid", ParamValue::Int(100))])).unwrap(), 100);
        assert_eq!(vmid(&params(&[("vmid", "250".into())])).unwrap(), 250);
        assert!(vmid(&params(&[("vmid", ParamValue::Int(99))])).is_err());
        assert!(vmid(&params(&[("vmid", ParamValue::Int(-1))])).is_err());
        assert!(vmid(&params(&[("vmid", ParamValue::Int(1_000_000_000))])).is_err());
        assert!(vmid(&params(&[("vmid", "100; reboot".into())])).is_err());
        assert!(vmid(&params(&[("vmid", "1e3".into())])).is_err());
        assert!(vmid(&params(&[])).is_err());
    }

    #[test]
    fn test_string_limits() {
        assert!(string(&params(&[("k", "a".repeat(MAX_STRING_LEN + 1).into())]), "k").is_err());
        assert!(string(&params(&[("k", "".into())]), "k").is_err());
        assert!(string(&params(&[("k", "a\nb".into())]), "k").is_err());
        assert!(string(&params(&[("k", ParamValue::Int(3))]), "k").is_err());
        assert_eq!(string(&params(&[("k", "fine".into())]), "k").unwrap(), "fine");
    }

    #[test]
    fn test_only_keys() {
        let p = params(&[("vmid", ParamValue::Int(100)), ("extra", "x".into())]);
        assert!(only_keys(&p, &["vmid"]).is_err());
        assert!(only_keys(&p, &["vmid", "extra"]).is_ok());
    }

    #[test]
    fn test_contained_path() {
        let allowed = tempfile::TempDir::new().unwrap();
        let outside = tempfile::TempDir::new().unwrap();
        let inside_file = allowed.path().join("disk.qcow2");
        std::fs::write(&inside_file, b"x").unwrap();
        let outside_file = outside.path().join("disk.qcow2");
        std::fs::write(&outside_file, b"x").unwrap();
        let dirs = vec![allowed.path().to_path_buf()];

        let ok = contained_path(&params(&[("p", ParamValue::Str(inside_file.display().to_string()))]), "p", &dirs);
        assert!(ok.is_ok());

        let escaped = format!("{}/../{}/disk.qcow2", allowed.path().display(), outside.path().display());
        assert!(contained_path(&params(&[("p", escaped.as_str().into())]), "p", &dirs).is_err());

        assert!(contained_path(&params(&[("p", ParamValue::Str(outside_file.display().to_string()))]), "p", &dirs).is_err());
        assert!(contained_path(&params(&[("p", "relative/disk.qcow2".into())]), "p", &dirs).is_err());

        #[cfg(unix)]
        {
            let link = allowed.path().join("link.qcow2");
            std::os::unix::fs::symlink(&outside_file, &link).unwrap();
            assert!(contained_path(&params(&[("p", ParamValue::Str(link.display().to_string()))]), "p", &dirs).is_err());
        }
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        let s = "é".repeat(100);
        assert!(truncate(&s).ends_with("..."));
    }
}
