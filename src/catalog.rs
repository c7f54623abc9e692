//! A catalog is the key prefix for one logical directory: every
//! object belonging to the directory lives at `$catalog/$name` in the
//! object store, and the catalog itself may span several
//! `/`-separated segments (e.g., `tenant/search/index`).
//!
//! Logical file names never contain the separator, so stripping the
//! catalog prefix off a listed key always recovers the name.
use crate::error::Error;
use crate::error::Result;

/// Object keys separate catalog segments with this character.
pub const SEPARATOR: char = '/';

/// Catalog used when the caller doesn't name one.
pub const DEFAULT_CATALOG: &str = "index";

/// Returns `path` with empty or whitespace-only segments removed, and
/// every remaining segment trimmed.
pub fn normalize(path: &str) -> String {
    path.split(SEPARATOR)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Checks that `name` can be used as a logical file name: it must be
/// non-empty, not contain a path separator, and not start with a dot
/// (the local cache keeps its own bookkeeping under dotted names).
pub fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "empty name"
    } else if name.contains(SEPARATOR) || name.contains('\\') {
        "contains a path separator"
    } else if name.starts_with('.') {
        "starts with a dot"
    } else {
        return Ok(());
    };

    Err(Error::InvalidName {
        name: name.to_owned(),
        reason,
    })
}

/// The normalized key prefix of one logical directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Catalog {
    path: String,
}

impl Catalog {
    /// Returns the catalog for `path`, after normalization.  An empty
    /// path maps names directly to keys at the root of the bucket.
    pub fn new(path: &str) -> Catalog {
        Catalog {
            path: normalize(path),
        }
    }

    /// Returns the catalog `$folder/$catalog`; a blank `catalog` falls
    /// back to [`DEFAULT_CATALOG`].
    pub fn within(folder: &str, catalog: &str) -> Catalog {
        let catalog = if catalog.trim().is_empty() {
            DEFAULT_CATALOG
        } else {
            catalog
        };

        Catalog::new(&format!("{}{}{}", folder, SEPARATOR, catalog))
    }

    /// Returns the normalized catalog path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the last segment of the catalog path.
    pub fn leaf(&self) -> &str {
        self.path.rsplit(SEPARATOR).next().unwrap_or("")
    }

    /// Returns the prefix shared by every key in this catalog.
    pub fn prefix(&self) -> String {
        if self.path.is_empty() {
            String::new()
        } else {
            format!("{}{}", self.path, SEPARATOR)
        }
    }

    /// Returns the object key for the logical file `name`.
    pub fn key(&self, name: &str) -> Result<String> {
        validate_name(name)?;
        Ok(format!("{}{}", self.prefix(), name))
    }

    /// Returns the logical name for `key`, or `None` if `key` does not
    /// name a file directly under this catalog.
    pub fn name<'a>(&self, key: &'a str) -> Option<&'a str> {
        let name = if self.path.is_empty() {
            key
        } else {
            key.strip_prefix(self.path.as_str())?
                .strip_prefix(SEPARATOR)?
        };

        if validate_name(name).is_ok() {
            Some(name)
        } else {
            None
        }
    }

    /// Accepts either a logical name or a key already qualified with
    /// this catalog's prefix, and returns the logical name.
    pub fn unqualify<'a>(&self, name: &'a str) -> &'a str {
        if self.path.is_empty() {
            return name;
        }

        self.name(name).unwrap_or(name)
    }
}

#[test]
fn test_normalize() {
    assert_eq!(normalize("foo/bar"), "foo/bar");
    assert_eq!(normalize("/foo//bar/"), "foo/bar");
    assert_eq!(normalize(" foo / \t /bar "), "foo/bar");
    assert_eq!(normalize(""), "");
    assert_eq!(normalize(" / "), "");
}

#[test]
fn test_within() {
    assert_eq!(Catalog::within("", "").path(), DEFAULT_CATALOG);
    assert_eq!(Catalog::within("backups/", "  ").path(), "backups/index");
    assert_eq!(Catalog::within("a/b", "c/d ").path(), "a/b/c/d");
    assert_eq!(Catalog::within("a/b", "c/d ").leaf(), "d");
}

#[test]
fn test_key_round_trip() {
    let catalog = Catalog::new("tenant/search");

    let key = catalog.key("segments.gen").expect("valid name");
    assert_eq!(key, "tenant/search/segments.gen");
    assert_eq!(catalog.name(&key), Some("segments.gen"));

    // Keys outside the catalog, or nested under it, aren't ours.
    assert_eq!(catalog.name("tenant/other/segments.gen"), None);
    assert_eq!(catalog.name("tenant/searchx/segments.gen"), None);
    assert_eq!(catalog.name("tenant/search/nested/file"), None);
    assert_eq!(catalog.name("tenant/search/"), None);
}

#[test]
fn test_root_catalog() {
    let catalog = Catalog::new("");

    assert_eq!(catalog.prefix(), "");
    assert_eq!(catalog.key("_0.cfs").expect("valid name"), "_0.cfs");
    assert_eq!(catalog.name("_0.cfs"), Some("_0.cfs"));
    assert_eq!(catalog.name("nested/_0.cfs"), None);
}

#[test]
fn test_invalid_names() {
    let catalog = Catalog::new("index");

    for name in &["", "a/b", "a\\b", ".hidden"] {
        assert!(
            matches!(catalog.key(name), Err(Error::InvalidName { .. })),
            "{:?} should be rejected",
            name
        );
    }
}

#[test]
fn test_unqualify() {
    let catalog = Catalog::new("index");

    assert_eq!(catalog.unqualify("index/_1.si"), "_1.si");
    assert_eq!(catalog.unqualify("_1.si"), "_1.si");
    assert_eq!(Catalog::new("").unqualify("_1.si"), "_1.si");
}
