use std::io::{self, Read};

use prost::Message;

use crate::criu::image::CrImg;
use crate::error::{Result, XferError};

const PB_PKOBJ_LOCAL_SIZE: usize = 1024;

/// Writes one size-prefixed object into the image.
pub fn pb_write_one<M: Message>(img: &mut CrImg, obj: &M) -> Result<()> {
    let size = obj.encoded_len();

    let mut buf = Vec::with_capacity(size.max(PB_PKOBJ_LOCAL_SIZE) + 4);
    buf.extend_from_slice(&(size as u32).to_ne_bytes());
    obj.encode(&mut buf)?;

    img.write_buf(&buf)
}

/// Reads as many bytes as are available up to `buf.len()`.
fn read_upto<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut done = 0;

    while done < buf.len() {
        match r.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(done)
}

/// Reads one size-prefixed object; `None` on a clean end of stream.
pub fn pb_read_one_eof<M: Message + Default, R: Read>(r: &mut R) -> Result<Option<M>> {
    let mut size_buf = [0u8; 4];
    let ret = read_upto(r, &mut size_buf)?;

    if ret == 0 {
        return Ok(None);
    } else if ret < size_buf.len() {
        return Err(XferError::InvalidImage {
            reason: format!("Read {} bytes while {} expected", ret, size_buf.len()),
        });
    }

    let size = u32::from_ne_bytes(size_buf) as usize;

    let mut buf = vec![0u8; size];
    let ret = read_upto(r, &mut buf)?;
    if ret < size {
        return Err(XferError::InvalidImage {
            reason: format!("Read {} bytes while {} expected", ret, size),
        });
    }

    Ok(Some(M::decode(&buf[..])?))
}

pub fn pb_read_one<M: Message + Default, R: Read>(r: &mut R) -> Result<M> {
    pb_read_one_eof(r)?.ok_or_else(|| XferError::InvalidImage {
        reason: "Unexpected EOF".to_string(),
    })
}
