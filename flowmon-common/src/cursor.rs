use core::{marker::PhantomData, mem};

/// A header did not fit before the end of the packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Truncated;

/// Marker for on-the-wire header layouts that can be copied out of a packet.
///
/// # Safety
///
/// Implementors must be `repr(C)` and valid for every bit pattern (byte arrays
/// and integers only, no enums, no references).
pub unsafe trait WireHeader: Copy {
    const LEN: usize = mem::size_of::<Self>();
}

/// Bounds-checked view over packet bytes in `[data, data_end)`.
///
/// Every load compares the end of the requested header against `data_end`
/// before touching memory, which is the only form of access the eBPF verifier
/// accepts for direct packet access.
#[derive(Clone, Copy)]
pub struct HeaderCursor<'a> {
    data: *const u8,
    data_end: *const u8,
    _packet: PhantomData<&'a [u8]>,
}

impl<'a> HeaderCursor<'a> {
    pub fn new(packet: &'a [u8]) -> Self {
        let range = packet.as_ptr_range();
        HeaderCursor {
            data: range.start,
            data_end: range.end,
            _packet: PhantomData,
        }
    }

    /// Builds a cursor over a raw packet region, as handed out by a TC context.
    ///
    /// # Safety
    ///
    /// `[data, data_end)` must be readable for the lifetime `'a`.
    #[inline(always)]
    pub unsafe fn from_raw(data: *const u8, data_end: *const u8) -> Self {
        HeaderCursor {
            data,
            data_end,
            _packet: PhantomData,
        }
    }

    /// Number of bytes in the packet.
    #[inline(always)]
    pub fn len(&self) -> usize {
        (self.data_end as usize).saturating_sub(self.data as usize)
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn ptr_at<T: WireHeader>(&self, offset: usize) -> Result<*const T, Truncated> {
        if self.data.wrapping_add(offset + T::LEN) > self.data_end {
            return Err(Truncated);
        }
        Ok(self.data.wrapping_add(offset) as *const T)
    }

    /// Copies the header `T` found at `offset`.
    #[inline(always)]
    pub fn load<T: WireHeader>(&self, offset: usize) -> Result<T, Truncated> {
        let ptr = self.ptr_at::<T>(offset)?;
        // SAFETY: `ptr_at` checked that the whole header lies inside the packet,
        // and `WireHeader` types accept any byte content.
        Ok(unsafe { ptr.read_unaligned() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{EthHdr, UdpHdr};

    #[test]
    fn load_fails_when_header_crosses_end() {
        let bytes = [0u8; 13];
        let cursor = HeaderCursor::new(&bytes);
        assert_eq!(cursor.load::<EthHdr>(0).err(), Some(Truncated));
    }

    #[test]
    fn load_at_exact_end_succeeds() {
        let mut bytes = [0u8; 22];
        bytes[14] = 0x03;
        bytes[15] = 0xe8;
        let cursor = HeaderCursor::new(&bytes);
        let udp = cursor.load::<UdpHdr>(14).unwrap();
        assert_eq!(udp.src_port(), 1000);
        assert_eq!(cursor.load::<UdpHdr>(15).err(), Some(Truncated));
    }

    #[test]
    fn empty_packet_has_nothing_to_load() {
        let cursor = HeaderCursor::new(&[]);
        assert!(cursor.is_empty());
        assert!(cursor.load::<UdpHdr>(0).is_err());
    }
}
