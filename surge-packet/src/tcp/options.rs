use byteorder::{ByteOrder, NetworkEndian};

mod field {
  pub const OPT_END: u8 = 0x00;
  pub const OPT_NOP: u8 = 0x01;
  pub const OPT_MSS: u8 = 0x02;
  pub const OPT_WS: u8 = 0x03;
}

/// Recognised TCP options. Anything else is surfaced as `Unknown` so the
/// caller can skip it by its declared length.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TcpOption<'a> {
  EndOfList,
  NoOperation,
  MaxSegmentSize(u16),
  WindowScale(u8),
  Unknown { kind: u8, data: &'a [u8] },
}

impl<'a> TcpOption<'a> {
  /// Parse one option, returning the rest of the buffer and the option.
  /// A malformed length terminates parsing with an error.
  pub fn parse(buffer: &'a [u8]) -> Result<(&'a [u8], TcpOption<'a>), ()> {
    let (length, option);
    match *buffer.first().ok_or(())? {
      field::OPT_END => {
        length = 1;
        option = TcpOption::EndOfList;
      }
      field::OPT_NOP => {
        length = 1;
        option = TcpOption::NoOperation;
      }
      kind => {
        length = *buffer.get(1).ok_or(())? as usize;
        if length < 2 {
          return Err(());
        }
        let data = buffer.get(2..length).ok_or(())?;
        match (kind, length) {
          (field::OPT_MSS, 4) => {
            option = TcpOption::MaxSegmentSize(NetworkEndian::read_u16(data))
          }
          (field::OPT_MSS, _) => return Err(()),
          (field::OPT_WS, 3) => option = TcpOption::WindowScale(data[0]),
          (field::OPT_WS, _) => return Err(()),
          (_, _) => option = TcpOption::Unknown { kind, data },
        }
      }
    }
    Ok((&buffer[length..], option))
  }

  pub fn buffer_len(&self) -> usize {
    match *self {
      TcpOption::EndOfList => 1,
      TcpOption::NoOperation => 1,
      TcpOption::MaxSegmentSize(_) => 4,
      TcpOption::WindowScale(_) => 3,
      TcpOption::Unknown { data, .. } => 2 + data.len(),
    }
  }

  pub fn build<'b>(&self, buffer: &'b mut [u8]) -> &'b mut [u8] {
    let length;
    match *self {
      TcpOption::EndOfList => {
        length = 1;
        for p in buffer.iter_mut() {
          *p = field::OPT_END;
        }
      }
      TcpOption::NoOperation => {
        length = 1;
        buffer[0] = field::OPT_NOP;
      }
      _ => {
        length = self.buffer_len();
        buffer[1] = length as u8;
        match *self {
          TcpOption::EndOfList | TcpOption::NoOperation => unreachable!(),
          TcpOption::MaxSegmentSize(value) => {
            buffer[0] = field::OPT_MSS;
            NetworkEndian::write_u16(&mut buffer[2..], value)
          }
          TcpOption::WindowScale(value) => {
            buffer[0] = field::OPT_WS;
            buffer[2] = value;
          }
          TcpOption::Unknown {
            kind,
            data: provided,
          } => {
            buffer[0] = kind;
            buffer[2..length].copy_from_slice(provided)
          }
        }
      }
    }
    &mut buffer[length..]
  }
}
