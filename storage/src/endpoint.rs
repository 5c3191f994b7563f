use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Backing bytes for a single [`Endpoint`]'s window.
///
/// Implementors hand out a raw, unbounded-lifetime view of their bytes; the
/// `Endpoint` that wraps them is responsible for never indexing outside
/// `[0, bytes().len())`, and the Access Coordinator above is responsible for
/// never letting two writable windows overlap.
pub(crate) trait PageBacking: Send + Sync {
    /// # Safety
    /// The returned slice aliases whatever other endpoints reference the same
    /// backing. The caller must only index into the `[lower, upper)` range it
    /// was handed when the endpoint was constructed.
    unsafe fn bytes(&self) -> &mut [u8];
}

/// A byte window onto underlying storage bytes, addressed by absolute index.
///
/// An `Endpoint` knows its own `[lower, upper)` bounds but does not track a
/// cursor; that's [`crate::Access`]'s job. Endpoints implement big-endian
/// encoding for every multi-byte primitive (see spec §4.1): the high byte of
/// a value always lands at the lowest address.
pub struct Endpoint {
    lower: u64,
    upper: u64,
    writable: bool,
    backing: Arc<dyn PageBacking>,
}

impl Endpoint {
    pub(crate) fn new(lower: u64, upper: u64, writable: bool, backing: Arc<dyn PageBacking>) -> Self {
        debug_assert!(lower <= upper);
        Self {
            lower,
            upper,
            writable,
            backing,
        }
    }

    /// Re-frame this endpoint's absolute bounds without touching its backing.
    ///
    /// Used by the split-file backend, whose part storages hand back
    /// endpoints addressed in per-part-local coordinates that must be
    /// translated into the caller's global index space.
    pub(crate) fn shifted(self, offset: u64) -> Self {
        Self {
            lower: self.lower + offset,
            upper: self.upper + offset,
            writable: self.writable,
            backing: self.backing,
        }
    }

    /// Shrink `upper` so the span is no longer than `max_len` bytes.
    ///
    /// Used by the split-file backend: a part's backing may be mapped well
    /// past its logical part boundary (the mapping over-allocates), so the
    /// endpoint it hands back must be capped at the part boundary before
    /// being shifted into global coordinates. Without this, an access that
    /// walks past the boundary would keep reading the current endpoint as
    /// "still covering" and silently touch bytes that belong to the next
    /// part.
    pub(crate) fn capped(self, max_len: u64) -> Self {
        let upper = self.lower + max_len.min(self.upper - self.lower);
        Self {
            lower: self.lower,
            upper,
            writable: self.writable,
            backing: self.backing,
        }
    }

    pub fn lower(&self) -> u64 {
        self.lower
    }

    pub fn upper(&self) -> u64 {
        self.upper
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Does this endpoint cover `[index, index+len)` in its entirety?
    pub fn covers(&self, index: u64, len: u64) -> bool {
        index >= self.lower && index.checked_add(len).is_some_and(|end| end <= self.upper)
    }

    fn check(&self, index: u64, len: u64) -> Result<usize> {
        if !self.covers(index, len) {
            return Err(Error::OutOfBounds {
                offset: index,
                len,
                size: self.upper - self.lower,
            });
        }
        Ok((index - self.lower) as usize)
    }

    fn check_write(&self, index: u64, len: u64) -> Result<usize> {
        if !self.writable {
            return Err(Error::OutOfBounds {
                offset: index,
                len,
                size: self.upper - self.lower,
            });
        }
        self.check(index, len)
    }

    pub fn read_u8(&self, index: u64) -> Result<u8> {
        let off = self.check(index, 1)?;
        Ok(unsafe { self.backing.bytes()[off] })
    }

    pub fn write_u8(&self, index: u64, value: u8) -> Result<()> {
        let off = self.check_write(index, 1)?;
        unsafe { self.backing.bytes()[off] = value };
        Ok(())
    }

    pub fn read_bytes(&self, index: u64, out: &mut [u8]) -> Result<()> {
        let off = self.check(index, out.len() as u64)?;
        out.copy_from_slice(unsafe { &self.backing.bytes()[off..off + out.len()] });
        Ok(())
    }

    pub fn write_bytes(&self, index: u64, data: &[u8]) -> Result<()> {
        let off = self.check_write(index, data.len() as u64)?;
        unsafe { self.backing.bytes()[off..off + data.len()].copy_from_slice(data) };
        Ok(())
    }

    pub fn read_short(&self, index: u64) -> Result<i16> {
        let mut buf = [0u8; 2];
        self.read_bytes(index, &mut buf)?;
        Ok(BigEndian::read_i16(&buf))
    }

    pub fn write_short(&self, index: u64, value: i16) -> Result<()> {
        let mut buf = [0u8; 2];
        BigEndian::write_i16(&mut buf, value);
        self.write_bytes(index, &buf)
    }

    /// 16-bit unsigned value (spec's "char").
    pub fn read_char(&self, index: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(index, &mut buf)?;
        Ok(BigEndian::read_u16(&buf))
    }

    pub fn write_char(&self, index: u64, value: u16) -> Result<()> {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.write_bytes(index, &buf)
    }

    pub fn read_int(&self, index: u64) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_bytes(index, &mut buf)?;
        Ok(BigEndian::read_i32(&buf))
    }

    pub fn write_int(&self, index: u64, value: i32) -> Result<()> {
        let mut buf = [0u8; 4];
        BigEndian::write_i32(&mut buf, value);
        self.write_bytes(index, &buf)
    }

    pub fn read_long(&self, index: u64) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_bytes(index, &mut buf)?;
        Ok(BigEndian::read_i64(&buf))
    }

    pub fn write_long(&self, index: u64, value: i64) -> Result<()> {
        let mut buf = [0u8; 8];
        BigEndian::write_i64(&mut buf, value);
        self.write_bytes(index, &buf)
    }

    pub fn read_float(&self, index: u64) -> Result<f32> {
        let mut buf = [0u8; 4];
        self.read_bytes(index, &mut buf)?;
        Ok(BigEndian::read_f32(&buf))
    }

    pub fn write_float(&self, index: u64, value: f32) -> Result<()> {
        let mut buf = [0u8; 4];
        BigEndian::write_f32(&mut buf, value);
        self.write_bytes(index, &buf)
    }

    pub fn read_double(&self, index: u64) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.read_bytes(index, &mut buf)?;
        Ok(BigEndian::read_f64(&buf))
    }

    pub fn write_double(&self, index: u64, value: f64) -> Result<()> {
        let mut buf = [0u8; 8];
        BigEndian::write_f64(&mut buf, value);
        self.write_bytes(index, &buf)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("lower", &self.lower)
            .field("upper", &self.upper)
            .field("writable", &self.writable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecBacking(crate::cell::RacyCell<Vec<u8>>);

    impl PageBacking for VecBacking {
        unsafe fn bytes(&self) -> &mut [u8] {
            unsafe { &mut *self.0.get() }
        }
    }

    fn endpoint(len: usize, writable: bool) -> Endpoint {
        let backing: Arc<dyn PageBacking> = Arc::new(VecBacking(crate::cell::RacyCell::new(vec![0u8; len])));
        Endpoint::new(0, len as u64, writable, backing)
    }

    #[test]
    fn big_endian_round_trip() {
        let e = endpoint(16, true);
        e.write_int(0, 0x01020304).unwrap();
        let mut raw = [0u8; 4];
        e.read_bytes(0, &mut raw).unwrap();
        assert_eq!(raw, [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(e.read_int(0).unwrap(), 0x01020304);

        e.write_long(4, -1).unwrap();
        assert_eq!(e.read_long(4).unwrap(), -1);

        e.write_char(0, 0xFFFE).unwrap();
        assert_eq!(e.read_char(0).unwrap(), 0xFFFE);

        e.write_double(8, 3.5).unwrap();
        assert_eq!(e.read_double(8).unwrap(), 3.5);
    }

    #[test]
    fn out_of_bounds_is_reported() {
        let e = endpoint(4, true);
        assert!(matches!(e.read_int(1), Err(Error::OutOfBounds { .. })));
        assert!(matches!(e.read_int(4), Err(Error::OutOfBounds { .. })));
    }

    #[test]
    fn write_on_read_only_fails() {
        let e = endpoint(8, false);
        assert!(matches!(e.write_u8(0, 1), Err(Error::OutOfBounds { .. })));
        assert!(e.read_u8(0).is_ok());
    }
}
