use std::io::{self, Write};

use anyhow::bail;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Locates the first complete frame in `input_buffer`.
///
/// Returns the body range (after the length prefix), or `None` while the
/// frame is still incomplete. A length beyond [`MAX_FRAME_LEN`] means the
/// stream can no longer be trusted.
pub fn dequeue_msg(input_buffer: &[u8]) -> anyhow::Result<Option<(usize, usize)>> {
    if input_buffer.len() < 4 {
        return Ok(None)
    }

    let msg_ln = LittleEndian::read_u32(&input_buffer[..4]) as usize;

    if msg_ln > MAX_FRAME_LEN {
        bail!("frame too long: {msg_ln}");
    }

    let end = msg_ln + 4;

    if input_buffer.len() < end {
        return Ok(None)
    }

    Ok(Some((4, end)))
}

/// Writes `[len][msg_type][body]` with `len` covering type and body.
pub fn write_frame(wtr: &mut impl Write, msg_type: u32, body: &[u8]) -> io::Result<()> {
    wtr.write_u32::<LittleEndian>(4 + body.len() as u32)?;
    wtr.write_u32::<LittleEndian>(msg_type)?;
    wtr.write_all(body)
}
