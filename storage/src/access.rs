use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// A `Storage` exposes a virtually unbounded, byte-addressable array through
/// scoped, range-reserved [`Access`]es (spec §2, §4.3).
///
/// Implementations must be safe to share across threads: every public entry
/// point takes `&self`, with any required mutation happening through
/// interior synchronization chosen by the backend.
pub trait Storage: Send + Sync {
    fn is_writable(&self) -> bool;

    /// Current logical size of the storage, in bytes.
    fn size(&self) -> u64;

    /// Persist all writes completed before this call returns. Does not order
    /// concurrent writes (spec §5).
    fn flush(&self) -> Result<()>;

    /// Shrink or no-op resize the storage to `new_size` bytes.
    ///
    /// Returns `Ok(false)` when `new_size >= size()` (nothing to do), and
    /// `Ok(true)` after actually truncating.
    fn truncate(&self, new_size: u64) -> Result<bool>;

    /// Acquire an [`Endpoint`] covering `index`, with write permission gated
    /// by `writable`.
    fn acquire_endpoint_at(&self, index: u64, writable: bool) -> Result<Endpoint>;

    /// Release a previously-acquired endpoint back to this storage.
    fn release_endpoint(&self, endpoint: Endpoint) -> Result<()>;

    /// Close the storage. Any later endpoint acquisition must fail with
    /// [`Error::AlreadyClosed`].
    fn close(&self) -> Result<()>;
}

/// A scoped, bounded cursor over `[location, location+length)` inside a
/// [`Storage`] (spec §4.2).
///
/// An `Access` caches one current endpoint and transparently re-acquires a
/// new one when the cursor walks off the edge of it, hiding endpoint
/// transitions from the caller. It is intentionally neither `Send` nor
/// `Sync`: the data model requires an access never be shared across threads.
pub struct Access {
    storage: Arc<dyn Storage>,
    location: u64,
    length: u64,
    cursor: u64,
    writable: bool,
    endpoint: Option<Endpoint>,
    closed: bool,
    // Accesses are single-threaded cursors (spec §3's Data Model); this
    // marker blocks them from being sent or shared across a thread boundary.
    _not_send_sync: std::marker::PhantomData<*const ()>,
}

impl Access {
    /// Construct an access over `[location, location+length)`.
    ///
    /// Nothing here checks for overlap with another live, writable access
    /// over the same storage — that invariant is the Access Coordinator's
    /// job. Call this directly only when you are the coordinator, or when
    /// you can otherwise prove no overlap is possible (e.g. in a test).
    pub fn new(storage: Arc<dyn Storage>, location: u64, length: u64, writable: bool) -> Self {
        Self {
            storage,
            location,
            length,
            cursor: location,
            writable,
            endpoint: None,
            closed: false,
            _not_send_sync: std::marker::PhantomData,
        }
    }

    pub fn location(&self) -> u64 {
        self.location
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Move the cursor to an absolute offset within `[0, length]`.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.bounds_check(offset, 0)?;
        self.cursor = self.location + offset;
        Ok(())
    }

    /// Move the cursor back to the start of the span.
    pub fn reset(&mut self) {
        self.cursor = self.location;
    }

    /// Move the cursor forward (or backward, for a negative `delta`) by
    /// `delta` bytes.
    pub fn skip(&mut self, delta: i64) -> Result<()> {
        let target = if delta >= 0 {
            self.cursor.checked_add(delta as u64)
        } else {
            self.cursor.checked_sub((-delta) as u64)
        };
        let Some(target) = target else {
            return Err(self.oob(0));
        };
        let offset = target.checked_sub(self.location).ok_or_else(|| self.oob(0))?;
        self.bounds_check(offset, 0)?;
        self.cursor = target;
        Ok(())
    }

    fn oob(&self, len: u64) -> Error {
        Error::OutOfBounds {
            offset: self.cursor,
            len,
            size: self.length,
        }
    }

    /// Ensure `[cursor, cursor+len)` fits within `[location, location+length]`.
    fn bounds_check(&self, offset: u64, len: u64) -> Result<()> {
        let end = offset.checked_add(len).ok_or_else(|| self.oob(len))?;
        if end > self.length {
            return Err(self.oob(len));
        }
        Ok(())
    }

    fn ensure_endpoint_covers(&mut self, at: u64) -> Result<()> {
        let needs_new = match &self.endpoint {
            Some(e) => !e.covers(at, 1),
            None => true,
        };
        if needs_new {
            if let Some(old) = self.endpoint.take() {
                self.storage.release_endpoint(old)?;
            }
            let endpoint = self.storage.acquire_endpoint_at(at, self.writable)?;
            self.endpoint = Some(endpoint);
        }
        Ok(())
    }

    fn read_span(&mut self, at: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_endpoint_covers(at)?;
        let fits = self.endpoint.as_ref().unwrap().covers(at, buf.len() as u64);
        if fits {
            return self.endpoint.as_ref().unwrap().read_bytes(at, buf);
        }
        // Byte-wise crossing: the primitive straddles an endpoint boundary.
        for (i, slot) in buf.iter_mut().enumerate() {
            let idx = at + i as u64;
            self.ensure_endpoint_covers(idx)?;
            *slot = self.endpoint.as_ref().unwrap().read_u8(idx)?;
        }
        Ok(())
    }

    fn write_span(&mut self, at: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(self.oob(data.len() as u64));
        }
        self.ensure_endpoint_covers(at)?;
        let fits = self.endpoint.as_ref().unwrap().covers(at, data.len() as u64);
        if fits {
            return self.endpoint.as_ref().unwrap().write_bytes(at, data);
        }
        for (i, byte) in data.iter().enumerate() {
            let idx = at + i as u64;
            self.ensure_endpoint_covers(idx)?;
            self.endpoint.as_ref().unwrap().write_u8(idx, *byte)?;
        }
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        self.bounds_check(self.cursor - self.location, 1)?;
        let mut buf = [0u8; 1];
        self.read_span(self.cursor, &mut buf)?;
        self.cursor += 1;
        Ok(buf[0])
    }

    pub fn write_byte(&mut self, value: u8) -> Result<()> {
        self.bounds_check(self.cursor - self.location, 1)?;
        self.write_span(self.cursor, &[value])?;
        self.cursor += 1;
        Ok(())
    }

    /// Read exactly `out.len()` bytes into `out`.
    pub fn read_byte_array(&mut self, out: &mut [u8]) -> Result<()> {
        self.bounds_check(self.cursor - self.location, out.len() as u64)?;
        self.read_span(self.cursor, out)?;
        self.cursor += out.len() as u64;
        Ok(())
    }

    /// Write every byte of `data`. The write length is always `data.len()`,
    /// never derived from the Access's own span length (spec §9's
    /// `writeBytes` fast-path bug).
    pub fn write_byte_array(&mut self, data: &[u8]) -> Result<()> {
        self.bounds_check(self.cursor - self.location, data.len() as u64)?;
        self.write_span(self.cursor, data)?;
        self.cursor += data.len() as u64;
        Ok(())
    }

    pub fn read_short(&mut self) -> Result<i16> {
        let mut buf = [0u8; 2];
        self.bounds_check(self.cursor - self.location, 2)?;
        self.read_span(self.cursor, &mut buf)?;
        self.cursor += 2;
        Ok(BigEndian::read_i16(&buf))
    }

    pub fn write_short(&mut self, value: i16) -> Result<()> {
        let mut buf = [0u8; 2];
        BigEndian::write_i16(&mut buf, value);
        self.bounds_check(self.cursor - self.location, 2)?;
        self.write_span(self.cursor, &buf)?;
        self.cursor += 2;
        Ok(())
    }

    /// 16-bit unsigned read (spec's "char").
    pub fn read_char(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.bounds_check(self.cursor - self.location, 2)?;
        self.read_span(self.cursor, &mut buf)?;
        self.cursor += 2;
        Ok(BigEndian::read_u16(&buf))
    }

    pub fn write_char(&mut self, value: u16) -> Result<()> {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.bounds_check(self.cursor - self.location, 2)?;
        self.write_span(self.cursor, &buf)?;
        self.cursor += 2;
        Ok(())
    }

    pub fn read_int(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.bounds_check(self.cursor - self.location, 4)?;
        self.read_span(self.cursor, &mut buf)?;
        self.cursor += 4;
        Ok(BigEndian::read_i32(&buf))
    }

    pub fn write_int(&mut self, value: i32) -> Result<()> {
        let mut buf = [0u8; 4];
        BigEndian::write_i32(&mut buf, value);
        self.bounds_check(self.cursor - self.location, 4)?;
        self.write_span(self.cursor, &buf)?;
        self.cursor += 4;
        Ok(())
    }

    pub fn read_long(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.bounds_check(self.cursor - self.location, 8)?;
        self.read_span(self.cursor, &mut buf)?;
        self.cursor += 8;
        Ok(BigEndian::read_i64(&buf))
    }

    pub fn write_long(&mut self, value: i64) -> Result<()> {
        let mut buf = [0u8; 8];
        BigEndian::write_i64(&mut buf, value);
        self.bounds_check(self.cursor - self.location, 8)?;
        self.write_span(self.cursor, &buf)?;
        self.cursor += 8;
        Ok(())
    }

    pub fn read_float(&mut self) -> Result<f32> {
        let mut buf = [0u8; 4];
        self.bounds_check(self.cursor - self.location, 4)?;
        self.read_span(self.cursor, &mut buf)?;
        self.cursor += 4;
        Ok(BigEndian::read_f32(&buf))
    }

    pub fn write_float(&mut self, value: f32) -> Result<()> {
        let mut buf = [0u8; 4];
        BigEndian::write_f32(&mut buf, value);
        self.bounds_check(self.cursor - self.location, 4)?;
        self.write_span(self.cursor, &buf)?;
        self.cursor += 4;
        Ok(())
    }

    pub fn read_double(&mut self) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.bounds_check(self.cursor - self.location, 8)?;
        self.read_span(self.cursor, &mut buf)?;
        self.cursor += 8;
        Ok(BigEndian::read_f64(&buf))
    }

    pub fn write_double(&mut self, value: f64) -> Result<()> {
        let mut buf = [0u8; 8];
        BigEndian::write_f64(&mut buf, value);
        self.bounds_check(self.cursor - self.location, 8)?;
        self.write_span(self.cursor, &buf)?;
        self.cursor += 8;
        Ok(())
    }

    /// Release any held endpoint and mark this access closed. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(endpoint) = self.endpoint.take() {
            self.storage.release_endpoint(endpoint)?;
        }
        Ok(())
    }
}

impl Drop for Access {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Access")
            .field("location", &self.location)
            .field("length", &self.length)
            .field("cursor", &self.cursor)
            .field("writable", &self.writable)
            .finish()
    }
}
