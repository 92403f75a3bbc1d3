//! RAUC update bundles.
//!
//! Content files, the signing key/cert and any keyring or intermediate
//! certificates become dependencies so they are built first; pkcs11 URIs are
//! passed straight through to rauc.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use color_eyre::{eyre::bail, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::Size;
use crate::exec;
use crate::handlers::{child, finalize_size, split_args, Handler};
use crate::image::{Child, Context, Image, Partition};
use crate::util::sanitize_path;

const PKCS11_PREFIX: &str = "pkcs11:";

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct RaucFileSpec {
	pub image: String,
	#[serde(default)]
	pub offset: Size,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct RaucOpts {
	pub extraargs: Option<String>,
	pub manifest: Option<String>,
	pub key: Option<String>,
	pub cert: Option<String>,
	pub keyring: Option<String>,
	#[serde(default)]
	pub intermediate: Vec<String>,
	/// Content copied into the bundle under its own name.
	#[serde(default)]
	pub files: Vec<String>,
	/// Content copied to an explicit target path (the section title).
	#[serde(default)]
	pub file: IndexMap<String, RaucFileSpec>,
}

pub struct Rauc {
	opts: RaucOpts,
}

impl Rauc {
	#[must_use]
	pub fn new(opts: RaucOpts) -> Self {
		Self { opts }
	}

	/// Built image path for a reference, or the URI itself for pkcs11.
	fn keysource<'a>(
		image: &Image, children: &'a [Option<Child>], value: &'a str,
	) -> Result<PathBuf> {
		if value.starts_with(PKCS11_PREFIX) {
			Ok(PathBuf::from(value))
		} else {
			Ok(child(image, children, value)?.outfile.clone())
		}
	}
}

fn copy_with_offset(src: &Path, dst: &Path, offset: u64) -> Result<()> {
	let mut from = std::fs::File::open(src)?;
	from.seek(SeekFrom::Start(offset))?;
	let mut to = std::fs::File::create(dst)?;
	std::io::copy(&mut from.by_ref(), &mut to)?;
	Ok(())
}

impl Handler for Rauc {
	fn ty(&self) -> &'static str {
		"rauc"
	}

	fn no_rootpath(&self) -> bool {
		true
	}

	fn parse(&mut self, image: &mut Image) -> Result<()> {
		let Some(key) = &self.opts.key else {
			bail!("{}: mandatory 'key' option is missing", image.tag());
		};
		let Some(cert) = &self.opts.cert else {
			bail!("{}: mandatory 'cert' option is missing", image.tag());
		};

		let mut depend = |name: &str| {
			image.partitions.push(Partition {
				name: String::new(),
				image: Some(name.to_owned()),
				in_partition_table: false,
				..Partition::default()
			});
		};
		for source in [Some(key), Some(cert), self.opts.keyring.as_ref()].into_iter().flatten() {
			if !source.starts_with(PKCS11_PREFIX) {
				depend(source);
			}
		}
		for uri in &self.opts.intermediate {
			if !uri.starts_with(PKCS11_PREFIX) {
				depend(uri);
			}
		}
		for entry in &self.opts.files {
			depend(entry);
		}
		for (target, spec) in &self.opts.file {
			image.partitions.push(Partition {
				name: target.clone(),
				image: Some(spec.image.clone()),
				imageoffset: spec.offset.bytes,
				in_partition_table: false,
				..Partition::default()
			});
		}
		Ok(())
	}

	fn setup(&mut self, _ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		if self.opts.manifest.as_deref().unwrap_or_default().is_empty() {
			bail!("{}: mandatory 'manifest' option is missing", image.tag());
		}
		Ok(())
	}

	fn generate(&self, ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		let Some(manifest) = self.opts.manifest.as_deref() else {
			bail!("{}: mandatory 'manifest' option is missing", image.tag());
		};
		let bundle_dir = ctx.opts.tmppath().join(format!("rauc-{}", sanitize_path(&image.file)));
		std::fs::create_dir_all(&bundle_dir)?;
		std::fs::write(bundle_dir.join("manifest.raucm"), manifest)?;

		let content: Vec<&Partition> = image
			.partitions
			.iter()
			.filter(|p| {
				let Some(name) = p.image.as_deref() else { return false };
				!p.name.is_empty() || self.opts.files.iter().any(|f| f == name)
			})
			.collect();
		for part in content {
			let Some(name) = part.image.as_deref() else { continue };
			let source = child(image, children, name)?;
			let target = if part.name.is_empty() {
				source.file.rsplit('/').next().unwrap_or(&source.file).to_owned()
			} else {
				part.name.clone()
			};
			if let Some(parent) = Path::new(&target).parent() {
				if !parent.as_os_str().is_empty() {
					std::fs::create_dir_all(bundle_dir.join(parent))?;
				}
			}
			let dst = bundle_dir.join(&target);
			tracing::info!(
				"{}: adding file '{}' as '{target}' (offset={})",
				image.tag(),
				source.file,
				part.imageoffset
			);
			if part.imageoffset != 0 {
				copy_with_offset(&source.outfile, &dst, part.imageoffset)?;
			} else {
				let _ = std::fs::remove_file(&dst);
				crate::io::insert_image(&dst, Some(&source.outfile), source.size, 0, 0)?;
			}
		}

		let key = Self::keysource(image, children, self.opts.key.as_deref().unwrap_or_default())?;
		let cert =
			Self::keysource(image, children, self.opts.cert.as_deref().unwrap_or_default())?;

		let _ = std::fs::remove_file(&image.outfile);
		let mut cmd = exec::tool(ctx.opts.tool("rauc"));
		cmd.arg("bundle")
			.arg(&bundle_dir)
			.arg(format!("--cert={}", cert.display()))
			.arg(format!("--key={}", key.display()));
		if let Some(keyring) = &self.opts.keyring {
			let keyring = Self::keysource(image, children, keyring)?;
			cmd.arg(format!("--keyring={}", keyring.display()));
		}
		for uri in &self.opts.intermediate {
			let inter = Self::keysource(image, children, uri)?;
			cmd.arg(format!("--intermediate={}", inter.display()));
		}
		cmd.args(split_args(&self.opts.extraargs));
		cmd.arg(&image.outfile);
		exec::run(&mut cmd)?;
		finalize_size(image)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn key_and_cert_become_dependencies() {
		let mut image = Image::blank();
		image.file = "update.raucb".to_owned();
		let mut h = Rauc::new(RaucOpts {
			key: Some("signing.key".to_owned()),
			cert: Some("signing.crt".to_owned()),
			files: vec!["rootfs.ext4".to_owned()],
			..RaucOpts::default()
		});
		h.parse(&mut image).unwrap();
		let deps: Vec<&str> =
			image.partitions.iter().filter_map(|p| p.image.as_deref()).collect();
		assert_eq!(deps, vec!["signing.key", "signing.crt", "rootfs.ext4"]);
	}

	#[test]
	fn pkcs11_sources_are_not_dependencies() {
		let mut image = Image::blank();
		let mut h = Rauc::new(RaucOpts {
			key: Some("pkcs11:token=sign;object=key".to_owned()),
			cert: Some("signing.crt".to_owned()),
			..RaucOpts::default()
		});
		h.parse(&mut image).unwrap();
		let deps: Vec<&str> =
			image.partitions.iter().filter_map(|p| p.image.as_deref()).collect();
		assert_eq!(deps, vec!["signing.crt"]);
	}

	#[test]
	fn missing_key_is_fatal() {
		let mut image = Image::blank();
		let mut h = Rauc::new(RaucOpts { cert: Some("c".to_owned()), ..RaucOpts::default() });
		assert!(h.parse(&mut image).is_err());
	}
}
