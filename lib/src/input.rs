use anyhow::{bail, Context, Result};
use image::RgbImage;
use percent_encoding::percent_decode_str;
use url::Url;

use crate::helpers::base64_decode;

/// Fetch and decode the image referenced by a prediction input.
///
/// `http` and `https` URLs are downloaded, `data:` URLs are decoded in place.
///
/// # Errors
///
/// Returns an error if the URL is invalid or unsupported, the download fails, or the bytes aren't a decodable image.
pub fn load_image(source: &str) -> Result<RgbImage> {
	let url = Url::parse(source).context("Image must be an http(s) or data URL")?;

	let bytes = match url.scheme() {
		"data" => from_dataurl(&url)?,
		"http" | "https" => download(&url)?,
		scheme => bail!("Unsupported image URL scheme {scheme:?}"),
	};

	let image = image::load_from_memory(&bytes).context("Failed to decode image")?;
	tracing::debug!("Decoded {}x{} image", image.width(), image.height());

	Ok(image.to_rgb8())
}

fn download(url: &Url) -> Result<Vec<u8>> {
	tracing::debug!("Downloading image from {url}");

	let response = reqwest::blocking::get(url.as_str())?.error_for_status()?;
	let bytes = response.bytes()?;

	tracing::debug!("Downloaded {} bytes from {url}", bytes.len());
	Ok(bytes.to_vec())
}

fn from_dataurl(url: &Url) -> Result<Vec<u8>> {
	let Some((header, data)) = url.path().split_once(',') else {
		bail!("Malformed data URL: missing ','");
	};

	let data = percent_decode_str(data).collect::<Vec<u8>>();
	if header.ends_with(";base64") {
		return Ok(base64_decode(data)?);
	}

	Ok(data)
}
