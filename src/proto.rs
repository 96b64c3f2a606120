//! Protobuf wire-format subset: varints, tagged fields and
//! length-delimited submessages, over fixed buffers with no allocation.
//!
//! Just enough of the encoding for the datalogger records and the SMU host
//! protocol: varint (wire type 0) and length-delimited (wire type 2)
//! fields. Zero-valued scalar fields and empty strings are skipped on
//! encode and read back as their defaults, following proto3 semantics.

/// Varint wire type.
pub const WIRE_VARINT: u8 = 0;
/// Length-delimited wire type.
pub const WIRE_LEN: u8 = 2;

/// The output buffer was too small for the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

/// Field-by-field encoder over a fixed buffer.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    /// Encoder writing from the start of `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.pos
    }

    /// `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    fn push(&mut self, byte: u8) -> Result<(), Overflow> {
        if self.pos >= self.buf.len() {
            return Err(Overflow);
        }
        self.buf[self.pos] = byte;
        self.pos += 1;
        Ok(())
    }

    /// Write a bare varint.
    pub fn write_varint(&mut self, mut value: u64) -> Result<(), Overflow> {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                return self.push(byte);
            }
            self.push(byte | 0x80)?;
        }
    }

    /// Write a field tag.
    pub fn write_tag(&mut self, field: u32, wire_type: u8) -> Result<(), Overflow> {
        self.write_varint((u64::from(field) << 3) | u64::from(wire_type))
    }

    /// Write an unsigned varint field; zero is skipped.
    pub fn write_uint_field(&mut self, field: u32, value: u64) -> Result<(), Overflow> {
        if value == 0 {
            return Ok(());
        }
        self.write_tag(field, WIRE_VARINT)?;
        self.write_varint(value)
    }

    /// Write a signed varint field (two's-complement, like protobuf
    /// `int32`/`int64`); zero is skipped.
    pub fn write_int_field(&mut self, field: u32, value: i64) -> Result<(), Overflow> {
        if value == 0 {
            return Ok(());
        }
        self.write_tag(field, WIRE_VARINT)?;
        self.write_varint(value as u64)
    }

    /// Write a bool field; `false` is skipped.
    pub fn write_bool_field(&mut self, field: u32, value: bool) -> Result<(), Overflow> {
        self.write_uint_field(field, u64::from(value))
    }

    /// Write a bytes field; empty is skipped.
    pub fn write_bytes_field(&mut self, field: u32, bytes: &[u8]) -> Result<(), Overflow> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.write_tag(field, WIRE_LEN)?;
        self.write_varint(bytes.len() as u64)?;
        for &byte in bytes {
            self.push(byte)?;
        }
        Ok(())
    }

    /// Write a UTF-8 string field; empty is skipped.
    pub fn write_str_field(&mut self, field: u32, text: &str) -> Result<(), Overflow> {
        self.write_bytes_field(field, text.as_bytes())
    }

    /// Write a submessage field, sizing the length prefix after encoding
    /// the body in place. Always written, even when the body is empty, so
    /// oneof members stay observable.
    pub fn write_message_field(
        &mut self,
        field: u32,
        encode: impl FnOnce(&mut Writer<'_>) -> Result<(), Overflow>,
    ) -> Result<(), Overflow> {
        self.write_tag(field, WIRE_LEN)?;
        // Encode the body after a one-byte length slot, then widen the slot
        // if the body turned out longer than 127 bytes.
        let slot = self.pos;
        self.push(0)?;
        let body_start = self.pos;
        {
            let mut body = Writer {
                buf: &mut self.buf[..],
                pos: body_start,
            };
            encode(&mut body)?;
            self.pos = body.pos;
        }
        let body_len = self.pos - body_start;
        let prefix_len = varint_len(body_len as u64);
        if prefix_len > 1 {
            let extra = prefix_len - 1;
            if self.pos + extra > self.buf.len() {
                return Err(Overflow);
            }
            self.buf
                .copy_within(body_start..self.pos, body_start + extra);
            self.pos += extra;
        }
        let mut prefix = Writer {
            buf: &mut self.buf[..],
            pos: slot,
        };
        prefix.write_varint(body_len as u64)?;
        Ok(())
    }

    /// Write a packed repeated signed varint field; empty is skipped.
    pub fn write_packed_int_field(&mut self, field: u32, values: &[i32]) -> Result<(), Overflow> {
        if values.is_empty() {
            return Ok(());
        }
        self.write_message_field(field, |body| {
            for &value in values {
                body.write_varint(i64::from(value) as u64)?;
            }
            Ok(())
        })
    }

    /// Write a packed repeated unsigned varint field; empty is skipped.
    pub fn write_packed_uint_field(&mut self, field: u32, values: &[u32]) -> Result<(), Overflow> {
        if values.is_empty() {
            return Ok(());
        }
        self.write_message_field(field, |body| {
            for &value in values {
                body.write_varint(u64::from(value))?;
            }
            Ok(())
        })
    }
}

/// Encoded size of a varint.
pub const fn varint_len(value: u64) -> usize {
    let mut len = 1;
    let mut rest = value >> 7;
    while rest != 0 {
        len += 1;
        rest >>= 7;
    }
    len
}

/// Encode a message with its delimiting length prefix, as stored in log
/// files and sent over the HID transport. Returns the total length.
pub fn encode_delimited(
    buf: &mut [u8],
    encode: impl FnOnce(&mut Writer<'_>) -> Result<(), Overflow>,
) -> Result<usize, Overflow> {
    // Body first, leaving room for the widest prefix we support (16 KiB).
    const PREFIX_BUDGET: usize = 2;
    if buf.len() < PREFIX_BUDGET {
        return Err(Overflow);
    }
    let body_len = {
        let mut writer = Writer::new(&mut buf[PREFIX_BUDGET..]);
        encode(&mut writer)?;
        writer.len()
    };
    let prefix_len = varint_len(body_len as u64);
    if prefix_len > PREFIX_BUDGET {
        return Err(Overflow);
    }
    if prefix_len != PREFIX_BUDGET {
        buf.copy_within(PREFIX_BUDGET..PREFIX_BUDGET + body_len, prefix_len);
    }
    let mut prefix = Writer::new(buf);
    prefix.write_varint(body_len as u64)?;
    Ok(prefix_len + body_len)
}

/// Field-by-field decoder over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Decoder reading from the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// `true` once the whole slice has been consumed.
    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read a bare varint.
    pub fn read_varint(&mut self) -> Option<u64> {
        let mut value = 0u64;
        for shift in 0..10 {
            let byte = *self.buf.get(self.pos)?;
            self.pos += 1;
            value |= u64::from(byte & 0x7F) << (7 * shift);
            if byte & 0x80 == 0 {
                return Some(value);
            }
        }
        None
    }

    /// Read the next field tag, or `None` at end of input.
    pub fn read_tag(&mut self) -> Option<(u32, u8)> {
        if self.at_end() {
            return None;
        }
        let tag = self.read_varint()?;
        Some(((tag >> 3) as u32, (tag & 0x7) as u8))
    }

    /// Read a length-delimited payload.
    pub fn read_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.read_varint()? as usize;
        let start = self.pos;
        let end = start.checked_add(len)?;
        if end > self.buf.len() {
            return None;
        }
        self.pos = end;
        Some(&self.buf[start..end])
    }

    /// Read a length-delimited UTF-8 string.
    pub fn read_str(&mut self) -> Option<&'a str> {
        core::str::from_utf8(self.read_bytes()?).ok()
    }

    /// Skip one field of the given wire type. Unknown and unsupported wire
    /// types fail the decode.
    pub fn skip(&mut self, wire_type: u8) -> Option<()> {
        match wire_type {
            WIRE_VARINT => self.read_varint().map(|_| ()),
            WIRE_LEN => self.read_bytes().map(|_| ()),
            5 => {
                // 32-bit fixed, tolerated for forward compatibility.
                let end = self.pos.checked_add(4)?;
                if end > self.buf.len() {
                    return None;
                }
                self.pos = end;
                Some(())
            }
            1 => {
                let end = self.pos.checked_add(8)?;
                if end > self.buf.len() {
                    return None;
                }
                self.pos = end;
                Some(())
            }
            _ => None,
        }
    }
}

/// Split a delimited message into its body, returning the body and the
/// total consumed length (prefix plus body).
pub fn read_delimited(buf: &[u8]) -> Option<(&[u8], usize)> {
    let mut reader = Reader::new(buf);
    let body = reader.read_bytes()?;
    Some((body, reader.pos))
}
