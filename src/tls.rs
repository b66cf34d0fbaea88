use crate::sniff::SniffError;

/// TLS 记录类型：握手
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
/// 握手类型：Client Hello
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
/// 扩展类型：server_name
const EXTENSION_SERVER_NAME: u16 = 0x0000;
/// server_name 列表里的 host_name 类型
const NAME_TYPE_HOST_NAME: u8 = 0x00;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;

/// 从目前收到的字节中解析 Client Hello 的 SNI
///
/// - `Ok(Some(host))`：拿到了 SNI
/// - `Ok(None)`：数据还不完整，需要继续读取
/// - `Err(_)`：不是 TLS、不是 Client Hello、格式错误或没有 SNI
///
/// Client Hello 可能被拆成多个 TLS 记录、也可能跨多次 TCP 读取，
/// 这里把各个握手记录的负载拼起来，直到整个握手消息完整。
pub fn inspect_client_hello(data: &[u8]) -> Result<Option<String>, SniffError> {
    if data.is_empty() {
        return Ok(None);
    }
    if data[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniffError::NotTls);
    }

    let mut handshake: Vec<u8> = Vec::new();
    let mut pos = 0;

    while pos + RECORD_HEADER_LEN <= data.len() {
        if data[pos] != CONTENT_TYPE_HANDSHAKE {
            return Err(SniffError::Malformed("Client Hello 中间夹杂了非握手记录"));
        }
        // TLS 1.0 - 1.3 的记录层版本都是 3.x
        if data[pos + 1] != 0x03 {
            return Err(SniffError::NotTls);
        }
        let record_len = u16::from_be_bytes([data[pos + 3], data[pos + 4]]) as usize;
        if record_len == 0 {
            return Err(SniffError::Malformed("空的 TLS 记录"));
        }

        let body_start = pos + RECORD_HEADER_LEN;
        let body_end = body_start + record_len;
        if body_end > data.len() {
            // 记录还没收全，先用已有部分检查握手类型，尽早拒绝
            handshake.extend_from_slice(&data[body_start..]);
            check_handshake_type(&handshake)?;
            return Ok(None);
        }

        handshake.extend_from_slice(&data[body_start..body_end]);
        pos = body_end;

        check_handshake_type(&handshake)?;
        if handshake.len() >= HANDSHAKE_HEADER_LEN {
            let hello_len = read_u24(&handshake[1..4]);
            let hello_end = HANDSHAKE_HEADER_LEN + hello_len;
            if handshake.len() >= hello_end {
                return parse_client_hello(&handshake[HANDSHAKE_HEADER_LEN..hello_end]).map(Some);
            }
        }
    }

    Ok(None)
}

fn check_handshake_type(handshake: &[u8]) -> Result<(), SniffError> {
    match handshake.first() {
        Some(&HANDSHAKE_CLIENT_HELLO) | None => Ok(()),
        Some(_) => Err(SniffError::NotClientHello),
    }
}

#[inline]
fn read_u24(b: &[u8]) -> usize {
    ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | (b[2] as usize)
}

/// 按顺序读取 Client Hello 字段，越界即视为格式错误
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], SniffError> {
        if self.pos + n > self.data.len() {
            return Err(SniffError::Malformed(what));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, SniffError> {
        Ok(self.bytes(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, SniffError> {
        let b = self.bytes(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// 长度前缀（1 或 2 字节）+ 内容
    fn vec8(&mut self, what: &'static str) -> Result<&'a [u8], SniffError> {
        let len = self.u8(what)? as usize;
        self.bytes(len, what)
    }

    fn vec16(&mut self, what: &'static str) -> Result<&'a [u8], SniffError> {
        let len = self.u16(what)? as usize;
        self.bytes(len, what)
    }
}

/// 解析完整的 Client Hello 消息体（不含 4 字节握手头部）
fn parse_client_hello(body: &[u8]) -> Result<String, SniffError> {
    let mut r = Reader::new(body);

    r.bytes(2, "client_version")?;
    r.bytes(32, "random")?;
    r.vec8("session_id")?;
    r.vec16("cipher_suites")?;
    r.vec8("compression_methods")?;

    // 没有扩展的 Client Hello 也是合法的，只是没有 SNI
    if r.is_empty() {
        return Err(SniffError::NoServerName);
    }

    let mut extensions = Reader::new(r.vec16("extensions")?);
    while !extensions.is_empty() {
        let ext_type = extensions.u16("extension_type")?;
        let ext_data = extensions.vec16("extension_data")?;
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(ext_data);
        }
    }

    Err(SniffError::NoServerName)
}

/// 解析 server_name 扩展，返回第一个 host_name
fn parse_server_name(ext: &[u8]) -> Result<String, SniffError> {
    let mut r = Reader::new(ext);
    let mut list = Reader::new(r.vec16("server_name_list")?);

    while !list.is_empty() {
        let name_type = list.u8("name_type")?;
        let name = list.vec16("host_name")?;
        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }
        if name.is_empty() || name.len() > 255 {
            return Err(SniffError::Malformed("host_name 长度无效"));
        }
        let host = std::str::from_utf8(name).map_err(|_| SniffError::Malformed("host_name 不是有效的 UTF-8"))?;
        if !host.is_ascii() {
            return Err(SniffError::Malformed("host_name 含有非 ASCII 字符"));
        }
        return Ok(host.to_string());
    }

    Err(SniffError::NoServerName)
}

/// 构造一个最小但结构完整的 Client Hello 记录，`host` 为 `None` 时不带 SNI 扩展
#[cfg(test)]
pub(crate) fn build_client_hello(host: Option<&str>) -> Vec<u8> {
    let mut extensions = Vec::new();

    // 放一个无关扩展在前面（supported_groups）
    extensions.extend_from_slice(&[0x00, 0x0a, 0x00, 0x04, 0x00, 0x02, 0x00, 0x1d]);

    if let Some(host) = host {
        let name = host.as_bytes();
        let mut sni = Vec::new();
        sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        sni.push(NAME_TYPE_HOST_NAME);
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);

        extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni);
    }

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0x42; 32]);
    body.push(32);
    body.extend_from_slice(&[0x17; 32]);
    body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x13, 0x02]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    split_into_records(&handshake, usize::MAX)
}

/// 把握手消息按 `max_record` 字节一段拆成多个 TLS 记录
#[cfg(test)]
pub(crate) fn split_into_records(handshake: &[u8], max_record: usize) -> Vec<u8> {
    let handshake = if handshake.first() == Some(&CONTENT_TYPE_HANDSHAKE) {
        // 已经是记录格式，先去掉外层
        unwrap_records(handshake)
    } else {
        handshake.to_vec()
    };

    let mut out = Vec::new();
    for chunk in handshake.chunks(max_record.min(u16::MAX as usize)) {
        out.extend_from_slice(&[CONTENT_TYPE_HANDSHAKE, 0x03, 0x01]);
        out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        out.extend_from_slice(chunk);
    }
    out
}

#[cfg(test)]
fn unwrap_records(records: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + RECORD_HEADER_LEN <= records.len() {
        let len = u16::from_be_bytes([records[pos + 3], records[pos + 4]]) as usize;
        out.extend_from_slice(&records[pos + RECORD_HEADER_LEN..pos + RECORD_HEADER_LEN + len]);
        pos += RECORD_HEADER_LEN + len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sni() {
        let hello = build_client_hello(Some("www.example.com"));
        assert_eq!(inspect_client_hello(&hello).unwrap().as_deref(), Some("www.example.com"));
    }

    #[test]
    fn test_incomplete_needs_more() {
        let hello = build_client_hello(Some("www.example.com"));

        // 任意前缀都应该是“还需要更多数据”，而不是错误
        for cut in 0..hello.len() {
            assert!(
                matches!(inspect_client_hello(&hello[..cut]), Ok(None)),
                "cut at {} of {}",
                cut,
                hello.len()
            );
        }
    }

    #[test]
    fn test_hello_split_across_records() {
        let hello = build_client_hello(Some("split.example.org"));
        let fragmented = split_into_records(&hello, 7);
        assert!(fragmented.len() > hello.len());

        assert_eq!(
            inspect_client_hello(&fragmented).unwrap().as_deref(),
            Some("split.example.org")
        );
        assert!(matches!(inspect_client_hello(&fragmented[..fragmented.len() - 1]), Ok(None)));
    }

    #[test]
    fn test_no_sni() {
        let hello = build_client_hello(None);
        assert!(matches!(inspect_client_hello(&hello), Err(SniffError::NoServerName)));
    }

    #[test]
    fn test_not_tls() {
        assert!(matches!(
            inspect_client_hello(b"GET / HTTP/1.1\r\n"),
            Err(SniffError::NotTls)
        ));
        assert!(matches!(
            inspect_client_hello(&[0x16, 0x02, 0x00, 0x00, 0x10]),
            Err(SniffError::NotTls)
        ));
    }

    #[test]
    fn test_not_client_hello() {
        // Server Hello (0x02)
        let data = [0x16, 0x03, 0x03, 0x00, 0x04, 0x02, 0x00, 0x00, 0x00];
        assert!(matches!(inspect_client_hello(&data), Err(SniffError::NotClientHello)));
    }

    #[test]
    fn test_malformed_lengths() {
        let mut hello = build_client_hello(Some("www.example.com"));
        // session_id 长度位于 记录头(5) + 握手头(4) + 版本(2) + 随机数(32)
        hello[5 + 4 + 2 + 32] = 0xff;
        assert!(matches!(inspect_client_hello(&hello), Err(SniffError::Malformed(_))));
    }

    #[test]
    fn test_trailing_application_data_is_ignored() {
        let mut data = build_client_hello(Some("a.test"));
        data.extend_from_slice(&[0x17, 0x03, 0x03, 0x00, 0x02, 0xaa, 0xbb]);
        assert_eq!(inspect_client_hello(&data).unwrap().as_deref(), Some("a.test"));
    }
}
