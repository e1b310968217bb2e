use byteorder::{ByteOrder, NetworkEndian};

pub const TCP_HEADER_LEN: usize = 20;

mod field {
  use core::ops::Range;

  pub const SRC_PORT: Range<usize> = 0..2;
  pub const DST_PORT: Range<usize> = 2..4;
  pub const SEQ_NUM: Range<usize> = 4..8;
  pub const ACK_NUM: Range<usize> = 8..12;
  pub const FLAGS: Range<usize> = 12..14;
  pub const WIN_SIZE: Range<usize> = 14..16;
  pub const CHECKSUM: Range<usize> = 16..18;
  pub const URGENT: Range<usize> = 18..20;

  pub const FLG_FIN: u16 = 0x001;
  pub const FLG_SYN: u16 = 0x002;
  pub const FLG_RST: u16 = 0x004;
  pub const FLG_PSH: u16 = 0x008;
  pub const FLG_ACK: u16 = 0x010;
  pub const FLG_URG: u16 = 0x020;
}

/// Decoded fixed TCP header. Options are handled separately by
/// [`TcpOption`](super::TcpOption) over the bytes past the fixed header.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct TcpHeader {
  pub src_port: u16,
  pub dst_port: u16,
  pub seq: u32,
  pub ack: u32,
  pub data_offset: u8,
  pub f_fin: bool,
  pub f_syn: bool,
  pub f_rst: bool,
  pub f_psh: bool,
  pub f_ack: bool,
  pub f_urg: bool,
  pub window: u16,
  pub checksum: u16,
  pub urgent: u16,
}

impl TcpHeader {
  /// Decode a fixed header. The caller is responsible for checking that the
  /// data offset does not point past the end of the segment.
  pub fn parse(data: &[u8]) -> Result<TcpHeader, ()> {
    if data.len() < TCP_HEADER_LEN {
      return Err(());
    }
    let flags = NetworkEndian::read_u16(&data[field::FLAGS]);
    let data_offset = (flags >> 12) as u8;
    if usize::from(data_offset) * 4 < TCP_HEADER_LEN {
      return Err(());
    }
    Ok(TcpHeader {
      src_port: NetworkEndian::read_u16(&data[field::SRC_PORT]),
      dst_port: NetworkEndian::read_u16(&data[field::DST_PORT]),
      seq: NetworkEndian::read_u32(&data[field::SEQ_NUM]),
      ack: NetworkEndian::read_u32(&data[field::ACK_NUM]),
      data_offset,
      f_fin: flags & field::FLG_FIN != 0,
      f_syn: flags & field::FLG_SYN != 0,
      f_rst: flags & field::FLG_RST != 0,
      f_psh: flags & field::FLG_PSH != 0,
      f_ack: flags & field::FLG_ACK != 0,
      f_urg: flags & field::FLG_URG != 0,
      window: NetworkEndian::read_u16(&data[field::WIN_SIZE]),
      checksum: NetworkEndian::read_u16(&data[field::CHECKSUM]),
      urgent: NetworkEndian::read_u16(&data[field::URGENT]),
    })
  }

  /// Encode the fixed header into the first 20 bytes of `buffer`.
  pub fn build(&self, buffer: &mut [u8]) {
    NetworkEndian::write_u16(&mut buffer[field::SRC_PORT], self.src_port);
    NetworkEndian::write_u16(&mut buffer[field::DST_PORT], self.dst_port);
    NetworkEndian::write_u32(&mut buffer[field::SEQ_NUM], self.seq);
    NetworkEndian::write_u32(&mut buffer[field::ACK_NUM], self.ack);
    let mut flags = (self.data_offset as u16) << 12;
    if self.f_fin {
      flags |= field::FLG_FIN;
    }
    if self.f_syn {
      flags |= field::FLG_SYN;
    }
    if self.f_rst {
      flags |= field::FLG_RST;
    }
    if self.f_psh {
      flags |= field::FLG_PSH;
    }
    if self.f_ack {
      flags |= field::FLG_ACK;
    }
    if self.f_urg {
      flags |= field::FLG_URG;
    }
    NetworkEndian::write_u16(&mut buffer[field::FLAGS], flags);
    NetworkEndian::write_u16(&mut buffer[field::WIN_SIZE], self.window);
    NetworkEndian::write_u16(&mut buffer[field::CHECKSUM], self.checksum);
    NetworkEndian::write_u16(&mut buffer[field::URGENT], self.urgent);
  }

  pub fn header_len(&self) -> usize {
    usize::from(self.data_offset) * 4
  }
}

#[cfg(test)]
mod test {
  use super::*;

  static PACKET_BYTES: [u8; 24] = [
    0xbf, 0x00, 0x00, 0x50, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef,
    0x60, 0x12, 0x01, 0x23, 0x01, 0xb6, 0x02, 0x01, 0x03, 0x03, 0x0c, 0x01,
  ];

  fn packet_repr() -> TcpHeader {
    TcpHeader {
      src_port: 48896,
      dst_port: 80,
      seq: 0x01234567,
      ack: 0x89abcdef,
      data_offset: 6,
      f_syn: true,
      f_ack: true,
      window: 0x0123,
      checksum: 0x01b6,
      ..TcpHeader::default()
    }
  }

  #[test]
  fn test_parse() {
    let th = TcpHeader::parse(&PACKET_BYTES).unwrap();
    assert_eq!(th, packet_repr());
    assert_eq!(th.header_len(), 24);
  }

  #[test]
  fn test_build_roundtrip() {
    let mut buffer = [0u8; 20];
    packet_repr().build(&mut buffer);
    assert_eq!(buffer, PACKET_BYTES[..20]);
    let th = TcpHeader::parse(&buffer).unwrap();
    assert_eq!(th, packet_repr());
  }

  #[test]
  fn test_parse_rejects_short_and_bad_offset() {
    assert_eq!(TcpHeader::parse(&PACKET_BYTES[..19]), Err(()));
    let mut bytes = PACKET_BYTES;
    // data offset of 4 words is shorter than the fixed header
    bytes[12] = 0x40;
    assert_eq!(TcpHeader::parse(&bytes), Err(()));
  }
}
