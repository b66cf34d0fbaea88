use crate::sniff::SniffError;

/// 请求行的长度上限，超过后直接判定为格式错误
const MAX_REQUEST_LINE: usize = 8192;

/// 从目前收到的字节中解析 HTTP 请求的 Host 头
///
/// 等到头部结束（`\r\n\r\n`）才给出结果，`Ok(None)` 表示需要继续读取。
/// 返回的主机名已去掉端口。
pub fn inspect_request(data: &[u8]) -> Result<Option<String>, SniffError> {
    // 请求行之前的空行直接忽略（RFC 9112 §2.2）
    let mut data = data;
    while let Some(rest) = data.strip_prefix(b"\r\n") {
        data = rest;
    }

    let header_end = match find(data, b"\r\n\r\n") {
        Some(end) => end,
        None => {
            // 请求行已经完整时提前校验，非 HTTP 流量不必等到缓冲区写满
            match find(data, b"\r\n") {
                Some(line_end) => check_request_line(&data[..line_end])?,
                None if data.len() > MAX_REQUEST_LINE => {
                    return Err(SniffError::Malformed("请求行过长"));
                }
                None => {}
            }
            return Ok(None);
        }
    };

    let head = std::str::from_utf8(&data[..header_end])
        .map_err(|_| SniffError::Malformed("请求头不是有效的 UTF-8"))?;

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    check_request_line(request_line.as_bytes())?;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(SniffError::Malformed("请求头缺少冒号"));
        };
        if name.trim().eq_ignore_ascii_case("host") {
            let host = strip_port(value.trim());
            if host.is_empty() {
                return Err(SniffError::NoHostHeader);
            }
            return Ok(Some(host.to_ascii_lowercase()));
        }
    }

    Err(SniffError::NoHostHeader)
}

/// `METHOD SP request-target SP HTTP/x.y`
fn check_request_line(line: &[u8]) -> Result<(), SniffError> {
    let line = std::str::from_utf8(line).map_err(|_| SniffError::Malformed("请求行不是有效的 UTF-8"))?;
    let mut parts = line.split(' ');

    let method = parts.next().unwrap_or_default();
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(SniffError::Malformed("无效的请求方法"));
    }
    match (parts.next(), parts.next(), parts.next()) {
        (Some(target), Some(version), None) if !target.is_empty() && version.starts_with("HTTP/") => Ok(()),
        _ => Err(SniffError::Malformed("无效的请求行")),
    }
}

/// 去掉 `host:port` 的端口，支持 `[v6]:port` 和裸 `[v6]`
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
