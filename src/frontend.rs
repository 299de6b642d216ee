//! 首页渲染、二维码与嵌入式静态资源。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{Html, IntoResponse, Response};
use qrcode::QrCode;
use qrcode::render::svg;
use rust_embed::RustEmbed;
use std::sync::Arc;
use tracing::warn;

use crate::config::Settings;
use crate::error::ApiError;
use crate::http::local_ip;
use crate::storage::{Storage, StoredFile};

#[derive(RustEmbed)]
#[folder = "assets"]
/// 嵌入式样式与脚本。
pub struct FrontendAssets;

/// 首页：上传表单、文件列表与局域网访问二维码。
pub async fn index(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(settings): Extension<Arc<Settings>>,
) -> Result<Html<String>, ApiError> {
    let files = storage.list_files().await?;
    let address = format!("http://{}:{}", local_ip(), settings.port);
    let qr = render_qr(&address);
    Ok(Html(render_index(&files, &settings, &address, qr.as_deref())))
}

/// 返回 `/static/` 下的嵌入式资源。
pub async fn serve_asset(Path(path): Path<String>) -> Result<Response, ApiError> {
    load_embedded_asset(&path)?.ok_or_else(|| ApiError::NotFound("not found".into()))
}

pub async fn not_found() -> ApiError {
    ApiError::NotFound("not found".into())
}

/// 加载指定路径的嵌入式资源。
fn load_embedded_asset(path: &str) -> Result<Option<Response>, ApiError> {
    let Some(asset) = FrontendAssets::get(path) else {
        return Ok(None);
    };
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    Ok(Some(
        (headers, AxumBody::from(asset.data.into_owned())).into_response(),
    ))
}

/// 以 SVG data URI 形式生成二维码，失败时返回 `None`。
fn render_qr(url: &str) -> Option<String> {
    match QrCode::new(url.as_bytes()) {
        Ok(code) => {
            let image = code
                .render::<svg::Color<'_>>()
                .min_dimensions(200, 200)
                .dark_color(svg::Color("#000000"))
                .light_color(svg::Color("#ffffff"))
                .build();
            Some(format!(
                "data:image/svg+xml;charset=utf-8,{}",
                urlencoding::encode(&image)
            ))
        }
        Err(err) => {
            warn!(url, error = %err, "failed to generate QR code");
            None
        }
    }
}

fn render_index(
    files: &[StoredFile],
    settings: &Settings,
    address: &str,
    qr: Option<&str>,
) -> String {
    let extensions = settings.extensions.dotted().join(",");

    let mut listing = String::new();
    if files.is_empty() {
        listing.push_str("<p class=\"empty\">No files uploaded yet.</p>");
    } else {
        listing.push_str("<ul class=\"files\">");
        for file in files {
            let encoded = urlencoding::encode(&file.name);
            listing.push_str(&format!(
                "<li><span class=\"name\">{name}</span>\
                 <span class=\"meta\">{size} &middot; {modified}</span>\
                 <a class=\"download\" href=\"/download/{encoded}\">Download</a>\
                 <a class=\"delete\" href=\"/delete/{encoded}\">Delete</a></li>",
                name = escape_html(&file.name),
                size = format_file_size(file.size),
                modified = file.modified.as_deref().unwrap_or("-"),
            ));
        }
        listing.push_str("</ul>");
    }

    let qr_block = match qr {
        Some(src) => format!(
            "<img class=\"qr\" src=\"{}\" width=\"200\" height=\"200\" alt=\"QR code\">",
            escape_html(src)
        ),
        None => "<p class=\"error\">QR code generation failed</p>".to_string(),
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>quickdrop</title>
<link rel="stylesheet" href="/static/style.css">
</head>
<body>
<main>
<h1>quickdrop</h1>
<section class="upload">
<h2>Upload files</h2>
<form id="upload-form" method="post" enctype="multipart/form-data" data-max-size="{max_size}" data-extensions="{extensions}">
<input type="file" name="file" multiple>
<p class="hint">Allowed: {extensions_label} &middot; max {max_label}</p>
<input type="submit" id="upload-button" value="Upload Files">
<progress id="upload-progress" value="0" max="100" hidden></progress>
<div id="upload-status" class="status" hidden></div>
</form>
</section>
<section class="listing">
<h2>Files</h2>
{listing}
</section>
<section class="connect">
<h2>Open on your phone</h2>
{qr_block}
<p><a href="{address}">{address}</a></p>
</section>
</main>
<script src="/static/app.js"></script>
</body>
</html>
"#,
        max_size = settings.max_file_size,
        extensions = escape_html(&extensions),
        extensions_label = escape_html(&extensions.replace(',', ", ")),
        max_label = format_file_size(settings.max_file_size),
        address = escape_html(address),
    )
}

/// 人类可读的文件大小，1024 进制，保留一位小数。
pub fn format_file_size(size: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if size == 0 {
        return "0B".to_string();
    }
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::ExtensionPolicy;
    use std::path::PathBuf;

    fn settings() -> Settings {
        Settings {
            upload_dir: PathBuf::from("/srv/uploads"),
            max_file_size: 100 * 1024 * 1024,
            extensions: ExtensionPolicy::new(["png", "txt"]),
            port: 8080,
        }
    }

    #[test]
    fn file_sizes_are_human_readable() {
        assert_eq!(format_file_size(0), "0B");
        assert_eq!(format_file_size(512), "512.0 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(104_857_600), "100.0 MB");
        assert_eq!(format_file_size(5 * 1024 * 1024 * 1024 * 1024), "5120.0 GB");
    }

    #[test]
    fn index_escapes_names_and_encodes_links() {
        let files = vec![StoredFile {
            name: "<b>&co.txt".to_string(),
            size: 2048,
            modified: Some("2026-01-02 03:04:05".to_string()),
        }];
        let html = render_index(&files, &settings(), "http://10.0.0.5:8080", None);

        assert!(html.contains("&lt;b&gt;&amp;co.txt"));
        assert!(html.contains("href=\"/download/%3Cb%3E%26co.txt\""));
        assert!(html.contains("href=\"/delete/%3Cb%3E%26co.txt\""));
        assert!(html.contains("2.0 KB &middot; 2026-01-02 03:04:05"));
        assert!(html.contains("data-extensions=\".png,.txt\""));
        assert!(html.contains("QR code generation failed"));
    }

    #[test]
    fn empty_listing_has_placeholder() {
        let html = render_index(&[], &settings(), "http://10.0.0.5:8080", None);
        assert!(html.contains("No files uploaded yet."));
    }

    #[test]
    fn qr_code_is_svg_data_uri() {
        let uri = render_qr("http://192.168.1.10:8080").expect("qr");
        assert!(uri.starts_with("data:image/svg+xml;charset=utf-8,"));
        assert!(uri.contains("svg"));
    }

    #[test]
    fn embedded_assets_are_served_with_mime() {
        let response = load_embedded_asset("style.css")
            .expect("load")
            .expect("asset exists");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css");
        assert!(load_embedded_asset("missing.css").expect("load").is_none());
    }
}
