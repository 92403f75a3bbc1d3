//! Configuration file model.
//!
//! The configuration is an HCL document with three top-level section kinds:
//! `config { … }` (program options), `flash "<name>" { … }` (flash
//! geometries) and `image "<file>" { … }` (one buildable output each).
//! `include = […]` entries pull in further files, resolved against the
//! colon-delimited `--includepath` and merged underneath the including file.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use color_eyre::{
	eyre::{bail, eyre, WrapErr},
	Result,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::handlers::opts::*;

/// A byte count parsed from the suffix grammar: `k`/`K` ×1024, `M` ×1024²,
/// `G` ×1024³, `s` ×512, `%` marks a fraction of the source-directory size.
/// Bare integers and `0x`-prefixed hex are accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "RawSize", into = "String")]
pub struct Size {
	pub bytes: u64,
	pub percent: bool,
}

impl Size {
	#[must_use]
	pub const fn bytes(bytes: u64) -> Self {
		Self { bytes, percent: false }
	}

	#[must_use]
	pub const fn is_zero(self) -> bool {
		self.bytes == 0
	}
}

impl From<Size> for String {
	fn from(s: Size) -> String {
		if s.percent {
			format!("{}%", s.bytes)
		} else {
			s.bytes.to_string()
		}
	}
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSize {
	Int(u64),
	Str(String),
}

impl TryFrom<RawSize> for Size {
	type Error = String;

	fn try_from(raw: RawSize) -> Result<Self, String> {
		match raw {
			RawSize::Int(bytes) => Ok(Self::bytes(bytes)),
			RawSize::Str(s) => s.parse().map_err(|e: color_eyre::Report| e.to_string()),
		}
	}
}

impl FromStr for Size {
	type Err = color_eyre::Report;

	fn from_str(s: &str) -> Result<Self> {
		let s = s.trim();
		let (radix, digits) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
			Some(hex) => (16, hex),
			None => (10, s),
		};
		let split = digits.find(|c: char| !c.is_digit(radix)).unwrap_or(digits.len());
		let (num, suffix) = digits.split_at(split);
		if num.is_empty() {
			bail!("invalid size '{s}'");
		}
		let value = u64::from_str_radix(num, radix).wrap_err_with(|| format!("invalid size '{s}'"))?;
		let (factor, percent) = match suffix {
			"" => (1, false),
			"G" => (1024 * 1024 * 1024, false),
			"M" => (1024 * 1024, false),
			"k" | "K" => (1024, false),
			"s" => (512, false),
			"%" => (1, true),
			_ => bail!("invalid size suffix '{suffix}' in '{s}'"),
		};
		Ok(Self { bytes: value * factor, percent })
	}
}

/// Parse a hole extent of the form `(start;end)`; both bounds take size
/// suffixes, the end is exclusive.
pub fn parse_extent(s: &str) -> Result<(u64, u64)> {
	let inner = s
		.trim()
		.strip_prefix('(')
		.and_then(|s| s.strip_suffix(')'))
		.ok_or_else(|| eyre!("invalid extent '{s}', expected '(start;end)'"))?;
	let (start, end) =
		inner.split_once(';').ok_or_else(|| eyre!("invalid extent '{s}', expected '(start;end)'"))?;
	let start: Size = start.parse()?;
	let end: Size = end.parse()?;
	if start.percent || end.percent {
		bail!("extent bounds must not be percentages: '{s}'");
	}
	if end.bytes <= start.bytes {
		bail!("extent end must lie beyond its start: '{s}'");
	}
	Ok((start.bytes, end.bytes))
}

fn de_u8_auto<'de, D: serde::Deserializer<'de>>(de: D) -> Result<u8, D::Error> {
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum Raw {
		Int(u64),
		Str(String),
	}
	let v = match Raw::deserialize(de)? {
		Raw::Int(i) => i,
		Raw::Str(s) => {
			Size::from_str(&s).map_err(serde::de::Error::custom)?.bytes
		},
	};
	u8::try_from(v).map_err(serde::de::Error::custom)
}

/// A scalar from the `config { … }` section, kept stringly for the option
/// store.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OptValue(pub String);

impl<'de> Deserialize<'de> for OptValue {
	fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Raw {
			Str(String),
			Int(i64),
			Bool(bool),
		}
		Ok(Self(match Raw::deserialize(de)? {
			Raw::Str(s) => s,
			Raw::Int(i) => i.to_string(),
			Raw::Bool(b) => b.to_string(),
		}))
	}
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FlashSpec {
	#[serde(default)]
	pub pebsize: Size,
	#[serde(default)]
	pub lebsize: Size,
	#[serde(default)]
	pub numpebs: Size,
	#[serde(default)]
	pub minimum_io_unit_size: Size,
	#[serde(default)]
	pub vid_header_offset: Size,
	#[serde(default)]
	pub sub_page_size: Size,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PartitionSpec {
	#[serde(default)]
	pub offset: Size,
	#[serde(default)]
	pub size: Size,
	#[serde(default)]
	pub align: Size,
	#[serde(default, deserialize_with = "de_u8_auto")]
	pub partition_type: u8,
	pub partition_type_uuid: Option<String>,
	pub partition_uuid: Option<String>,
	#[serde(default)]
	pub bootable: bool,
	#[serde(default)]
	pub read_only: bool,
	#[serde(default)]
	pub hidden: bool,
	#[serde(default)]
	pub no_automount: bool,
	#[serde(default)]
	pub fill: bool,
	#[serde(default = "default_true")]
	pub in_partition_table: bool,
	#[serde(default)]
	pub autoresize: bool,
	#[serde(default)]
	pub forced_primary: bool,
	pub image: Option<String>,
	#[serde(default)]
	pub holes: Vec<String>,
}

const fn default_true() -> bool {
	true
}

/// One `image "<file>" { … }` section. Exactly one of the handler-type
/// subsections must be present.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ImageSpec {
	pub name: Option<String>,
	#[serde(default)]
	pub size: Size,
	pub mountpoint: Option<String>,
	pub srcpath: Option<String>,
	#[serde(default)]
	pub empty: bool,
	#[serde(default)]
	pub temporary: bool,
	pub exec_pre: Option<String>,
	pub exec_post: Option<String>,
	pub flashtype: Option<String>,
	#[serde(default)]
	pub partition: IndexMap<String, PartitionSpec>,

	pub android_sparse: Option<AndroidSparseOpts>,
	pub btrfs: Option<BtrfsOpts>,
	pub cpio: Option<CpioOpts>,
	pub cramfs: Option<CramfsOpts>,
	pub custom: Option<CustomOpts>,
	pub erofs: Option<ErofsOpts>,
	pub ext2: Option<ExtOpts>,
	pub ext3: Option<ExtOpts>,
	pub ext4: Option<ExtOpts>,
	pub f2fs: Option<F2fsOpts>,
	pub file: Option<FileOpts>,
	pub fip: Option<FipOpts>,
	pub fit: Option<FitOpts>,
	pub flash: Option<FlashImageOpts>,
	pub hdimage: Option<HdimageOpts>,
	pub iso: Option<IsoOpts>,
	pub jffs2: Option<Jffs2Opts>,
	pub mdraid: Option<MdraidOpts>,
	pub qemu: Option<QemuOpts>,
	pub rauc: Option<RaucOpts>,
	pub squashfs: Option<SquashfsOpts>,
	pub tar: Option<TarOpts>,
	pub ubi: Option<UbiOpts>,
	pub ubifs: Option<UbifsOpts>,
	pub vfat: Option<VfatOpts>,
	pub verity: Option<VerityOpts>,
	pub verity_sig: Option<VeritySigOpts>,
}

impl ImageSpec {
	/// Names of all handler sections present in this image block.
	#[must_use]
	pub fn handler_sections(&self) -> Vec<&'static str> {
		let mut present = Vec::new();
		macro_rules! check {
			($($field:ident => $name:literal),* $(,)?) => {
				$(if self.$field.is_some() { present.push($name); })*
			};
		}
		check! {
			android_sparse => "android-sparse", btrfs => "btrfs", cpio => "cpio",
			cramfs => "cramfs", custom => "custom", erofs => "erofs", ext2 => "ext2",
			ext3 => "ext3", ext4 => "ext4", f2fs => "f2fs", file => "file", fip => "fip",
			fit => "fit", flash => "flash", hdimage => "hdimage", iso => "iso",
			jffs2 => "jffs2", mdraid => "mdraid", qemu => "qemu", rauc => "rauc",
			squashfs => "squashfs", tar => "tar", ubi => "ubi", ubifs => "ubifs",
			vfat => "vfat", verity => "verity", verity_sig => "verity-sig",
		}
		present
	}
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
	#[serde(default)]
	pub include: Vec<String>,
	#[serde(default)]
	pub config: IndexMap<String, OptValue>,
	#[serde(default)]
	pub flash: IndexMap<String, FlashSpec>,
	#[serde(default)]
	pub image: IndexMap<String, ImageSpec>,
}

impl Config {
	/// The `config { … }` section as plain strings for the option store.
	#[must_use]
	pub fn opt_section(&self) -> IndexMap<String, String> {
		self.config.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect()
	}

	fn load_one(path: &Path) -> Result<Self> {
		trace!(?path, "parsing config file");
		let text = std::fs::read_to_string(path)
			.wrap_err_with(|| format!("could not open config file '{}'", path.display()))?;
		hcl::from_str(&text).wrap_err_with(|| format!("could not parse '{}'", path.display()))
	}

	fn resolve_include(name: &str, cfgdir: &Path, searchpath: &[PathBuf]) -> Result<PathBuf> {
		let direct = cfgdir.join(name);
		if direct.exists() {
			return Ok(direct);
		}
		for dir in searchpath {
			let candidate = dir.join(name);
			if candidate.exists() {
				return Ok(candidate);
			}
		}
		bail!("include '{name}' not found (searched {cfgdir:?} and {searchpath:?})")
	}

	/// Load a configuration file and everything it includes. Included files
	/// are merged first so the including file wins on conflicts.
	pub fn load(path: &Path, searchpath: &[PathBuf]) -> Result<Self> {
		let top = Self::load_one(path)?;
		let cfgdir = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);

		let mut merged = Self::default();
		for name in &top.include {
			let incpath = Self::resolve_include(name, &cfgdir, searchpath)?;
			debug!(?incpath, "including config file");
			let included = Self::load(&incpath, searchpath)?;
			merged = merge_struct::merge(&merged, &included)?;
		}
		let mut merged = merge_struct::merge(&merged, &top)?;
		merged.include.clear();
		Ok(merged)
	}
}
