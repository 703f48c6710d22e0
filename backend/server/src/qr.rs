use base64::{Engine, engine::general_purpose::STANDARD};
use qrcode::{QrCode, render::svg, types::QrError};

pub const QR_SIZE: u32 = 256;

/// Renders `url` as an SVG QR code embedded in a `data:` URL, ready for an `<img>` tag.
pub fn qr_data_url(url: &str) -> Result<String, QrError> {
    let code = QrCode::new(url.as_bytes())?;
    let image = code
        .render::<svg::Color>()
        .min_dimensions(QR_SIZE, QR_SIZE)
        .build();

    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qr_data_url() {
        let image = qr_data_url("http://localhost:3000/register/abc").unwrap();
        let encoded = image.strip_prefix("data:image/svg+xml;base64,").unwrap();
        let svg = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();

        assert!(svg.contains("<svg"));
    }
}
