#![no_std]

#[cfg(feature = "gzip")]
pub use gzip;

#[cfg(feature = "inflate")]
pub use inflate;
