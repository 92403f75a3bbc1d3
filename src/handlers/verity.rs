//! dm-verity hash trees and their UAPI signature envelopes.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use color_eyre::{
	eyre::{bail, eyre, WrapErr},
	Result,
};
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{first_child, split_args, Handler};
use crate::image::{Child, Context, Image, Partition};
use crate::io;
use crate::util::sanitize_path;

/// Where a `verity` image leaves its root hash for `verity-sig` images that
/// reference it.
fn root_hash_path(tmp: &Path, verity_file: &str) -> PathBuf {
	tmp.join(format!("{}.root-hash", sanitize_path(verity_file)))
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct VerityOpts {
	/// The data image the hash tree is computed over.
	pub image: Option<String>,
	pub extraargs: Option<String>,
}

pub struct Verity {
	opts: VerityOpts,
}

impl Verity {
	#[must_use]
	pub fn new(opts: VerityOpts) -> Self {
		Self { opts }
	}
}

impl Handler for Verity {
	fn ty(&self) -> &'static str {
		"verity"
	}

	fn no_rootpath(&self) -> bool {
		true
	}

	fn parse(&mut self, image: &mut Image) -> Result<()> {
		let Some(data) = &self.opts.image else {
			bail!("{}: mandatory 'image' option is missing", image.tag());
		};
		image.partitions.push(Partition {
			name: String::new(),
			image: Some(data.clone()),
			in_partition_table: false,
			..Partition::default()
		});
		Ok(())
	}

	fn generate(&self, ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		io::prepare_image(&image.outfile, image.size)?;
		let data = first_child(image, children)?;

		// the root hash lands in tmp, where verity-sig images can find it
		let hash_file = root_hash_path(ctx.opts.tmppath(), &image.file);
		let mut cmd = exec::tool(ctx.opts.tool("veritysetup"));
		cmd.arg("format")
			.arg("--root-hash-file")
			.arg(&hash_file)
			.args(split_args(&self.opts.extraargs))
			.arg(&data.outfile)
			.arg(&image.outfile);
		exec::run(&mut cmd)?;

		let generated = std::fs::metadata(&image.outfile)?.len();
		if image.size != 0 && image.size < generated {
			bail!(
				"{}: specified image size ({}) is too small, generated {generated} bytes",
				image.tag(),
				image.size
			);
		}
		tracing::debug!("{}: generated {generated} bytes", image.tag());
		image.size = generated;
		Ok(())
	}
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct VeritySigOpts {
	/// The `verity` image whose root hash gets signed.
	pub image: Option<String>,
	pub cert: Option<String>,
	pub key: Option<String>,
}

pub struct VeritySig {
	opts: VeritySigOpts,
}

impl VeritySig {
	#[must_use]
	pub fn new(opts: VeritySigOpts) -> Self {
		Self { opts }
	}
}

/// The signature JSON defined by the UAPI discoverable partitions spec;
/// field order is part of the format.
#[derive(Serialize)]
struct SigEnvelope<'a> {
	#[serde(rename = "rootHash")]
	root_hash: &'a str,
	#[serde(rename = "certificateFingerprint")]
	certificate_fingerprint: &'a str,
	signature: &'a str,
}

fn sha256_fingerprint(ctx: &Context, cert: &str) -> Result<String> {
	let out = exec::run(
		exec::tool(ctx.opts.tool("openssl"))
			.args(["x509", "-in", cert, "-noout", "-fingerprint", "-sha256"]),
	)?;
	let text = String::from_utf8_lossy(&out);
	let digest = text
		.trim()
		.rsplit('=')
		.next()
		.ok_or_else(|| eyre!("unexpected openssl fingerprint output: {text}"))?;
	Ok(digest.replace(':', "").to_ascii_lowercase())
}

fn cms_signature(ctx: &Context, payload: &str, cert: &str, key: &str) -> Result<String> {
	let mut payload_file = tempfile::NamedTempFile::new()?;
	payload_file.write_all(payload.as_bytes())?;
	let out = exec::run(
		exec::tool(ctx.opts.tool("openssl"))
			.args(["cms", "-sign", "-nocerts", "-noattr", "-binary", "-in"])
			.arg(payload_file.path())
			.args(["-signer", cert, "-inkey", key, "-outform", "PEM"]),
	)?;
	// keep only the base64 body between the CMS markers
	let pem = String::from_utf8_lossy(&out);
	Ok(pem
		.lines()
		.filter(|l| !l.starts_with("-----"))
		.collect::<Vec<_>>()
		.concat())
}

impl Handler for VeritySig {
	fn ty(&self) -> &'static str {
		"verity-sig"
	}

	fn no_rootpath(&self) -> bool {
		true
	}

	fn parse(&mut self, image: &mut Image) -> Result<()> {
		let Some(verity) = &self.opts.image else {
			bail!("{}: mandatory 'image' option is missing", image.tag());
		};
		image.partitions.push(Partition {
			name: String::new(),
			image: Some(verity.clone()),
			in_partition_table: false,
			..Partition::default()
		});
		Ok(())
	}

	fn setup(&mut self, _ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		if self.opts.cert.as_deref().unwrap_or_default().is_empty() {
			bail!("{}: mandatory 'cert' option is missing", image.tag());
		}
		if self.opts.key.as_deref().unwrap_or_default().is_empty() {
			bail!("{}: mandatory 'key' option is missing", image.tag());
		}
		Ok(())
	}

	fn generate(&self, ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		let verity = first_child(image, children)?;
		let hash_file = root_hash_path(ctx.opts.tmppath(), &verity.file);
		let root_hash = std::fs::read_to_string(&hash_file)
			.wrap_err_with(|| {
				format!("{}: no root hash at {}", image.tag(), hash_file.display())
			})?
			.trim()
			.to_owned();

		let (Some(cert), Some(key)) = (self.opts.cert.as_deref(), self.opts.key.as_deref()) else {
			bail!("{}: 'cert' and 'key' are required", image.tag());
		};
		let fingerprint = sha256_fingerprint(ctx, cert)?;
		let signature = cms_signature(ctx, &root_hash, cert, key)?;

		let envelope = SigEnvelope {
			root_hash: &root_hash,
			certificate_fingerprint: &fingerprint,
			signature: &signature,
		};
		let mut json = serde_json::to_string(&envelope)?.into_bytes();
		// pad to the 4096-byte boundary dm-verity signature partitions use
		json.resize(json.len().div_ceil(4096) * 4096, 0);

		io::prepare_image(&image.outfile, json.len() as u64)?;
		io::insert_data(&image.outfile, &json, 0)?;
		image.size = json.len() as u64;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn envelope_key_order() {
		let e = SigEnvelope {
			root_hash: "d3b0",
			certificate_fingerprint: "ab12",
			signature: "MIIB",
		};
		let json = serde_json::to_string(&e).unwrap();
		assert_eq!(
			json,
			r#"{"rootHash":"d3b0","certificateFingerprint":"ab12","signature":"MIIB"}"#
		);
	}

	#[test]
	fn root_hash_path_is_sanitized() {
		let p = root_hash_path(Path::new("/tmp/work"), "sub/verity.img");
		assert_eq!(p, PathBuf::from("/tmp/work/sub-verity.img.root-hash"));
	}

	#[test]
	fn missing_input_rejected_at_parse() {
		let mut image = Image::blank();
		assert!(Verity::new(VerityOpts::default()).parse(&mut image).is_err());
		assert!(VeritySig::new(VeritySigOpts::default()).parse(&mut image).is_err());
	}
}
