//! Resolve image and audio references into upstream `inlineData` parts.
//!
//! Remote images are fetched and base64-encoded; `data:` URIs are split into
//! mime type and payload without decoding.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::gemini_types::Part;
use super::openai_types::InputAudio;
use crate::error::{GatewayError, Result};

const FALLBACK_MIME: &str = "application/octet-stream";

pub async fn resolve_image(client: &reqwest::Client, url: &str) -> Result<Part> {
    if url.starts_with("http://") || url.starts_with("https://") {
        fetch_image(client, url).await
    } else {
        parse_data_uri(url)
    }
}

async fn fetch_image(client: &reqwest::Client, url: &str) -> Result<Part> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| GatewayError::ImageFetch(format!("{e} ({url})")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(GatewayError::ImageFetch(format!("{status} ({url})")));
    }

    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(FALLBACK_MIME)
        .to_string();

    let bytes = response
        .bytes()
        .await
        .map_err(|e| GatewayError::ImageFetch(format!("{e} ({url})")))?;

    tracing::debug!(url = %url, mime_type = %mime_type, len = bytes.len(), "Fetched image");

    Ok(Part::inline_data(mime_type, STANDARD.encode(&bytes)))
}

/// `data:<mime>[;base64],<payload>`
pub fn parse_data_uri(uri: &str) -> Result<Part> {
    let invalid = || GatewayError::InvalidImageData(truncate(uri, 64).to_string());

    let rest = uri.strip_prefix("data:").ok_or_else(invalid)?;
    let (header, data) = rest.split_once(',').ok_or_else(invalid)?;
    if header.contains(['\n', '\r']) || data.contains(['\n', '\r']) {
        return Err(invalid());
    }
    let mime_type = header.strip_suffix(";base64").unwrap_or(header);

    Ok(Part::inline_data(mime_type, data))
}

pub fn audio_part(audio: &InputAudio) -> Part {
    Part::inline_data(format!("audio/{}", audio.format), audio.data.clone())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_data_uri() {
        let part = parse_data_uri("data:image/png;base64,iVBORw0KGgo=").unwrap();
        assert_eq!(part, Part::inline_data("image/png", "iVBORw0KGgo="));
    }

    #[test]
    fn test_data_uri_without_base64_marker() {
        let part = parse_data_uri("data:image/svg+xml,<svg/>").unwrap();
        assert_eq!(part, Part::inline_data("image/svg+xml", "<svg/>"));
    }

    #[test]
    fn test_invalid_data_uris() {
        for uri in ["ftp://example.com/a.png", "data:image/png;base64", "iVBORw0KGgo="] {
            let err = parse_data_uri(uri).unwrap_err();
            assert!(matches!(err, GatewayError::InvalidImageData(_)), "{uri}");
        }
    }

    #[test]
    fn test_audio_mime_is_synthesized() {
        let part = audio_part(&InputAudio {
            data: "UklGRg==".to_string(),
            format: "wav".to_string(),
        });
        assert_eq!(part, Part::inline_data("audio/wav", "UklGRg=="));
    }

    #[tokio::test]
    async fn test_unreachable_image_is_fetch_error() {
        let client = reqwest::Client::new();
        let err = resolve_image(&client, "http://127.0.0.1:1/missing.png")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ImageFetch(_)));
    }
}
