//! Path joining utilities, the pipeline resolves a lot of file locations so
//! these shortcuts avoid temporary formatted strings.

use std::path::{Path, PathBuf};
use std::ffi::OsStr;


/// Extension to the standard [`Path`].
pub trait PathExt {

    /// Join a file name and its extension to this path in a single pass,
    /// without formatting an intermediate `name.ext` string.
    fn join_with_ext<P: AsRef<Path>, S: AsRef<OsStr>>(&self, name: P, ext: S) -> PathBuf;

}

impl PathExt for Path {

    #[inline]
    fn join_with_ext<P: AsRef<Path>, S: AsRef<OsStr>>(&self, name: P, ext: S) -> PathBuf {
        self.join(name).appended(".").appended(ext)
    }

}

/// Extension to the standard [`PathBuf`] for chained joining and raw appending.
pub trait PathBufExt {

    /// Return this path joined with another one, without reallocating a new
    /// path for each join.
    fn joined<P: AsRef<Path>>(self, path: P) -> Self;

    /// Return this path with a raw string appended, no separator is added.
    fn appended<S: AsRef<OsStr>>(self, s: S) -> Self;

}

impl PathBufExt for PathBuf {

    #[inline]
    fn joined<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.push(path);
        self
    }

    #[inline]
    fn appended<S: AsRef<OsStr>>(mut self, s: S) -> Self {
        self.as_mut_os_string().push(s);
        self
    }

}
