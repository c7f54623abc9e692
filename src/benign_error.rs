/// Some [`std::io::Error`]s only mean that a cached copy or staged
/// object went away underneath us: the cache is allowed to lose
/// files, and another handle may have replaced or deleted one.
use std::io::Error;
use std::io::ErrorKind;

/// Checks whether the error is for a missing file: NotFound, or stale
/// handle.  A cache directory on NFS may report ESTALE for a file
/// another client just replaced; for a cache, that's the same as the
/// file being absent, and the caller will refetch it.
pub fn is_absent_file_error(error: &Error) -> bool {
    if error.kind() == ErrorKind::NotFound {
        true
    } else if let Some(errno) = error.raw_os_error() {
        errno == libc::ESTALE
    } else {
        false
    }
}

/// Maps absent-file errors to `None`, and passes everything else
/// through.
pub fn absent_as_none<T>(result: std::io::Result<T>) -> std::io::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if is_absent_file_error(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

#[test]
fn test_classification() {
    assert!(is_absent_file_error(&Error::new(
        ErrorKind::NotFound,
        "not found"
    )));
    assert!(!is_absent_file_error(&Error::new(
        ErrorKind::PermissionDenied,
        "bad"
    )));

    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ENOENT)));
    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ESTALE)));
    assert!(!is_absent_file_error(&Error::from_raw_os_error(libc::EIO)));
}

#[test]
fn test_absent_as_none() {
    assert!(matches!(absent_as_none(Ok(3)), Ok(Some(3))));
    assert!(matches!(
        absent_as_none::<u64>(Err(Error::from_raw_os_error(libc::ESTALE))),
        Ok(None)
    ));
    assert!(matches!(
        absent_as_none::<u64>(Err(Error::from(ErrorKind::PermissionDenied))),
        Err(e) if e.kind() == ErrorKind::PermissionDenied
    ));
}
