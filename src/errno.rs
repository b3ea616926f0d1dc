//! Error codes returned by the driver.
//!
//! The set of codes mirrors the POSIX `errno` values an ext2 implementation needs to report to
//! its caller, plus `EUCLEAN` for on-disk structures that fail internal consistency checks.
//! Codes are a plain internal enumeration rather than the platform's numeric `errno.h` values:
//! the driver never returns them to userspace directly, the VFS dispatcher above it does the
//! translation to whatever ABI it exposes.

use core::fmt;

/// An error code.
pub type Errno = i32;

/// Result type alias used throughout the driver.
pub type EResult<T> = Result<T, Errno>;

macro_rules! errnos {
	($($name:ident = $val:expr, $doc:expr;)*) => {
		$(
			#[doc = $doc]
			pub const $name: Errno = $val;
		)*

		/// Returns a human readable name for an error code, or `"EUNKNOWN"` if the code is not
		/// recognized.
		pub fn name(e: Errno) -> &'static str {
			match e {
				$($name => stringify!($name),)*
				_ => "EUNKNOWN",
			}
		}
	};
}

errnos! {
	EPERM = 1, "Operation not permitted";
	ENOENT = 2, "No such file or directory";
	EIO = 5, "I/O error";
	ENXIO = 6, "No such device or address";
	E2BIG = 7, "Argument list too long";
	EBADF = 9, "Bad file descriptor";
	EAGAIN = 11, "Resource temporarily unavailable";
	ENOMEM = 12, "Out of memory";
	EACCES = 13, "Permission denied";
	EFAULT = 14, "Bad address";
	EEXIST = 17, "File exists";
	EXDEV = 18, "Cross-device link";
	ENODEV = 19, "No such device";
	ENOTDIR = 20, "Not a directory";
	EISDIR = 21, "Is a directory";
	EINVAL = 22, "Invalid argument";
	ENFILE = 23, "Too many open files in system";
	EMFILE = 24, "Too many open files";
	EFBIG = 27, "File too large";
	ENOSPC = 28, "No space left on device";
	ESPIPE = 29, "Illegal seek";
	EROFS = 30, "Read-only filesystem";
	EMLINK = 31, "Too many links";
	ENAMETOOLONG = 36, "Filename too long";
	ENOSYS = 38, "Function not implemented";
	ENOTEMPTY = 39, "Directory not empty";
	ELOOP = 40, "Too many levels of symbolic links";
	ENODATA = 61, "No data available";
	EOVERFLOW = 75, "Value too large for defined data type";
	EUCLEAN = 117, "Structure needs cleaning";
}

/// Wraps an [`Errno`] together with the name of the code, for [`fmt::Display`] purposes.
pub struct ErrnoDisplay(pub Errno);

impl fmt::Display for ErrnoDisplay {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} ({})", name(self.0), self.0)
	}
}

/// Builds an [`Errno`] value from one of the named constants in this module.
///
/// This exists mainly so call sites read as `errno!(ENOENT)` instead of `errno::ENOENT`,
/// matching the shape of error construction used across the rest of the driver.
macro_rules! errno {
	($name:ident) => {
		$crate::errno::$name
	};
}

pub(crate) use errno;
