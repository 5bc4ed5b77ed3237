//! Ethernet frame construction for tests.

use bytes::{BufMut, Bytes, BytesMut};
use flowmon_common::{ETH_P_IP, IPPROTO_TCP, IPPROTO_UDP};

pub const MAC_A: [u8; 6] = [0x02, 0, 0, 0, 0, 0x0a];
pub const MAC_B: [u8; 6] = [0x02, 0, 0, 0, 0, 0x0b];

pub struct FrameBuilder {
    src: [u8; 4],
    dst: [u8; 4],
    proto: u8,
    l4: BytesMut,
    min_len: usize,
}

impl FrameBuilder {
    pub fn ipv4(src: [u8; 4], dst: [u8; 4]) -> Self {
        FrameBuilder {
            src,
            dst,
            proto: 0,
            l4: BytesMut::new(),
            min_len: 0,
        }
    }

    pub fn udp(mut self, src_port: u16, dst_port: u16) -> Self {
        self.proto = IPPROTO_UDP;
        self.l4.put_u16(src_port);
        self.l4.put_u16(dst_port);
        self.l4.put_u16(8);
        self.l4.put_u16(0);
        self
    }

    pub fn tcp(mut self, src_port: u16, dst_port: u16, seq: u32, flags: u8) -> Self {
        self.proto = IPPROTO_TCP;
        self.l4.put_u16(src_port);
        self.l4.put_u16(dst_port);
        self.l4.put_u32(seq);
        self.l4.put_u32(0);
        self.l4.put_u8(0x50);
        self.l4.put_u8(flags);
        self.l4.put_u16(0xffff);
        self.l4.put_u32(0);
        self
    }

    /// Zero-pads the frame up to `len` bytes.
    pub fn padded_to(mut self, len: usize) -> Self {
        self.min_len = len;
        self
    }

    pub fn build(self) -> Bytes {
        let mut f = BytesMut::with_capacity(self.min_len.max(64));
        f.put_slice(&MAC_B);
        f.put_slice(&MAC_A);
        f.put_u16(ETH_P_IP);

        f.put_u8(0x45);
        f.put_u8(0);
        f.put_u16((20 + self.l4.len()) as u16);
        f.put_u32(0);
        f.put_u8(64);
        f.put_u8(self.proto);
        f.put_u16(0);
        f.put_slice(&self.src);
        f.put_slice(&self.dst);

        f.put_slice(&self.l4);
        if f.len() < self.min_len {
            f.resize(self.min_len, 0);
        }
        f.freeze()
    }
}
