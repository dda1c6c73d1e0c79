use std::io::{self, Error, ErrorKind, Read};
use std::os::unix::io::RawFd;

/// Writes the whole buffer into a blocking descriptor.
pub fn write_all(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut remaining = buf;

    while !remaining.is_empty() {
        let ret = unsafe {
            libc::write(fd, remaining.as_ptr() as *const libc::c_void, remaining.len())
        };

        if ret == -1 {
            let err = Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            /*
             * The caller should use standard write() for
             * non-blocking I/O.
             */
            if err.kind() == ErrorKind::WouldBlock {
                return Err(Error::from_raw_os_error(libc::EINVAL));
            }
            return Err(err);
        }
        if ret == 0 {
            return Err(Error::new(ErrorKind::WriteZero, "write returned 0"));
        }

        remaining = &remaining[ret as usize..];
    }

    Ok(())
}

/// Fills `buf` from a stream. Returns the number of bytes read, which is
/// short only if the stream ended.
pub fn read_all<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0usize;

    while total < buf.len() {
        match r.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_read_all_short_stream() {
        let mut r = Cursor::new(vec![1u8, 2, 3]);
        let mut buf = [0u8; 8];
        assert_eq!(read_all(&mut r, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(read_all(&mut r, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_write_all_file() {
        let path = std::env::temp_dir().join(format!("crust_xfer_util_{}", std::process::id()));
        let f = std::fs::File::create(&path).unwrap();
        write_all(f.as_raw_fd(), b"hello").unwrap();
        drop(f);

        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        let _ = std::fs::remove_file(&path);
    }
}
