/// Bucket, endpoint and content-type helpers / 存储桶、端点与内容类型工具函数

/// Fallback content type / 默认内容类型
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Map a caller-supplied container to the effective bucket / 解析实际存储桶
///
/// Blank containers fall back to `default_bucket`, which may itself be empty.
/// Callers must reject an empty result before issuing remote calls.
pub fn resolve_bucket(container: Option<&str>, default_bucket: &str) -> String {
    match container {
        Some(c) if !c.trim().is_empty() => c.to_string(),
        _ => default_bucket.to_string(),
    }
}

/// Get file extension (lowercase) / 获取文件扩展名
pub fn get_ext(path: &str) -> String {
    std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Infer content type from the file extension / 根据扩展名推断内容类型
///
/// Fixed table; anything unknown is `application/octet-stream`.
pub fn content_type_for_path(path: &str) -> &'static str {
    match get_ext(path).as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        _ => OCTET_STREAM,
    }
}

/// Strip scheme and trailing slashes from an endpoint / 移除协议和尾部斜杠
pub fn endpoint_host(service_url: &str) -> String {
    let mut host = service_url.trim();

    // Remove protocol / 移除协议
    if let Some(pos) = host.find("://") {
        host = &host[pos + 3..];
    }

    host.trim_end_matches('/').to_string()
}

/// Endpoint with the scheme chosen by `secure` / 按 secure 生成带协议的端点
pub fn endpoint_with_scheme(service_url: &str, secure: bool) -> String {
    let scheme = if secure { "https" } else { "http" };
    format!("{}://{}", scheme, endpoint_host(service_url))
}

/// Path-style unsigned URL: scheme://host/bucket/key / 路径风格直链
pub fn direct_url(service_url: &str, bucket: &str, key: &str, secure: bool) -> String {
    format!("{}/{}/{}", endpoint_with_scheme(service_url, secure), bucket, key)
}
