//! Byte buffers carrying progress across readiness ticks.

use memchr::memchr;

/// Outbound bytes with a send cursor. Partial sends advance the cursor; the
/// storage is recycled once everything queued has left.
#[derive(Debug, Default)]
pub(crate) struct OutBuf {
    data: Vec<u8>,
    pos: usize,
}

impl OutBuf {
    pub(crate) fn has_pending(&self) -> bool {
        self.pos < self.data.len()
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub(crate) fn pending(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn advance(&mut self, sent: usize) {
        self.pos += sent;
        if self.pos >= self.data.len() {
            self.data.clear();
            self.pos = 0;
        }
    }
}

/// Inbound accumulator with newline framing. Extracted lines leave a
/// consumed prefix behind; [`InBuf::compact`] drops it after a processing
/// pass so no complete line ever lingers.
#[derive(Debug, Default)]
pub(crate) struct InBuf {
    data: Vec<u8>,
    start: usize,
}

impl InBuf {
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Carves off the next newline-terminated line, without the terminator.
    pub(crate) fn next_line(&mut self) -> Option<Vec<u8>> {
        let nl = memchr(b'\n', &self.data[self.start..])?;
        let line = self.data[self.start..self.start + nl].to_vec();
        self.start += nl + 1;
        Some(line)
    }

    pub(crate) fn compact(&mut self) {
        self.data.drain(..self.start);
        self.start = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_cursor_tracks_partial_sends() {
        let mut out = OutBuf::default();
        out.push(b"hello ");
        out.push(b"world");
        assert_eq!(out.pending(), b"hello world");
        out.advance(6);
        assert_eq!(out.pending(), b"world");
        out.advance(5);
        assert!(!out.has_pending());
        assert_eq!(out.pending(), b"");
    }

    #[test]
    fn lines_come_out_regardless_of_segmentation() {
        let mut inbuf = InBuf::default();
        inbuf.extend(b"abc\nde");
        assert_eq!(inbuf.next_line().as_deref(), Some(&b"abc"[..]));
        assert_eq!(inbuf.next_line(), None);
        inbuf.compact();
        inbuf.extend(b"f\ng\n");
        assert_eq!(inbuf.next_line().as_deref(), Some(&b"def"[..]));
        assert_eq!(inbuf.next_line().as_deref(), Some(&b"g"[..]));
        assert_eq!(inbuf.next_line(), None);
        inbuf.compact();
    }

    #[test]
    fn empty_line_is_still_a_line() {
        let mut inbuf = InBuf::default();
        inbuf.extend(b"\n\nx\n");
        assert_eq!(inbuf.next_line().as_deref(), Some(&b""[..]));
        assert_eq!(inbuf.next_line().as_deref(), Some(&b""[..]));
        assert_eq!(inbuf.next_line().as_deref(), Some(&b"x"[..]));
    }
}
