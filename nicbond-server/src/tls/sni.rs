/// Pull the SNI host name out of a raw TLS ClientHello, if one is present in
/// the buffer. Tolerant of truncated input: any parse failure yields `None`.
pub fn extract_sni(buf: &[u8]) -> Option<String> {
    let mut rec = Cursor::new(buf);

    // TLS record header: content type must be handshake (22).
    if rec.u8()? != 0x16 {
        return None;
    }
    rec.skip(2)?; // legacy record version
    let record_len = rec.u16()? as usize;
    let mut hs = Cursor::new(rec.take(record_len.min(rec.remaining()))?);

    // Handshake header: message type must be ClientHello (1).
    if hs.u8()? != 0x01 {
        return None;
    }
    let body_len = hs.u24()? as usize;
    let mut hello = Cursor::new(hs.take(body_len.min(hs.remaining()))?);

    hello.skip(2)?; // client version
    hello.skip(32)?; // random
    let session_id_len = hello.u8()? as usize;
    hello.skip(session_id_len)?;
    let cipher_suites_len = hello.u16()? as usize;
    hello.skip(cipher_suites_len)?;
    let compression_len = hello.u8()? as usize;
    hello.skip(compression_len)?;

    let extensions_len = hello.u16()? as usize;
    let mut exts = Cursor::new(hello.take(extensions_len.min(hello.remaining()))?);

    while exts.remaining() >= 4 {
        let ext_type = exts.u16()?;
        let ext_len = exts.u16()? as usize;
        let ext_data = exts.take(ext_len)?;
        if ext_type != 0x0000 {
            continue;
        }
        // server_name extension: list length, then (type, length, name).
        let mut names = Cursor::new(ext_data);
        let list_len = names.u16()? as usize;
        let mut list = Cursor::new(names.take(list_len)?);
        while list.remaining() >= 3 {
            let name_type = list.u8()?;
            let name_len = list.u16()? as usize;
            let name = list.take(name_len)?;
            if name_type == 0x00 {
                return String::from_utf8(name.to_vec()).ok();
            }
        }
        return None;
    }
    None
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let b = self.take(2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<u32> {
        let b = self.take(3)?;
        Some(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal ClientHello record carrying a single SNI entry.
    fn client_hello_with_sni(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        let mut sni_entry = vec![0x00]; // host_name type
        sni_entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni_entry.extend_from_slice(name);

        let mut sni_ext = (sni_entry.len() as u16).to_be_bytes().to_vec();
        sni_ext.extend_from_slice(&sni_entry);

        let mut extensions = vec![0x00, 0x00]; // extension type: server_name
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);

        let mut hello = vec![0x03, 0x03]; // client version
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0); // session id
        hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        hello.extend_from_slice(&[0x01, 0x00]); // null compression
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_from_client_hello() {
        let record = client_hello_with_sni("dl.example.com");
        assert_eq!(extract_sni(&record).as_deref(), Some("dl.example.com"));
    }

    #[test]
    fn rejects_non_tls_input() {
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(extract_sni(&[]), None);
    }

    #[test]
    fn tolerates_truncation() {
        let record = client_hello_with_sni("dl.example.com");
        for len in 0..record.len() - 1 {
            // Must never panic, whatever the cut point.
            let _ = extract_sni(&record[..len]);
        }
    }
}
