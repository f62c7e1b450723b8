use anyhow::anyhow;

use crate::error::MeasurementError;

// NB: newer versions of `bytes` define `try_get_*` on `Buf`, these names must not collide
macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!(MeasurementError::Format(format!(
                    "buffer underflow reading {} ({} bytes remaining)", stringify!($ty), self.remaining()
                ))));
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked big-endian getters for parsing untrusted input
pub trait BufExt: bytes::Buf {
    get_checked_impl!(get_u16_checked, u16, get_u16);
    get_checked_impl!(get_i32_checked, i32, get_i32);
    get_checked_impl!(get_i64_checked, i64, get_i64);
    get_checked_impl!(get_f64_checked, f64, get_f64);

    /// Splits off exactly `len` bytes, failing if fewer are remaining
    fn get_bytes_checked(&mut self, len: usize) -> anyhow::Result<bytes::Bytes> {
        if self.remaining() < len {
            return Err(anyhow!(MeasurementError::Format(format!(
                "buffer underflow reading {} bytes ({} bytes remaining)", len, self.remaining()
            ))));
        }
        Ok(self.copy_to_bytes(len))
    }
}

impl <T: bytes::Buf> BufExt for T {
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::exact(b"\x00\x01", Some(1))]
    #[case::remainder(b"\x01\x00\x07", Some(256))]
    #[case::too_short(b"\x01", None)]
    #[case::empty(b"", None)]
    fn test_get_u16_checked(#[case] mut buf: &[u8], #[case] expected: Option<u16>) {
        match buf.get_u16_checked() {
            Ok(actual) => assert_eq!(Some(actual), expected),
            Err(e) => {
                assert!(expected.is_none());
                assert!(matches!(e.downcast_ref::<MeasurementError>(), Some(MeasurementError::Format(_))));
            }
        }
    }

    #[rstest]
    #[case::exact(b"abc", 3, true, b"")]
    #[case::remainder(b"abcd", 3, true, b"d")]
    #[case::too_short(b"ab", 3, false, b"ab")]
    fn test_get_bytes_checked(#[case] mut buf: &[u8], #[case] len: usize, #[case] ok: bool, #[case] buf_after: &[u8]) {
        assert_eq!(buf.get_bytes_checked(len).is_ok(), ok);
        assert_eq!(buf, buf_after);
    }
}
