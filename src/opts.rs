//! Layered program options.
//!
//! Every option has a canonical name, an environment variable and a compiled
//! default. Initialization applies, in order: default, environment, the
//! `config` section of the configuration file, command-line switches. Later
//! sources overwrite earlier ones. The store is loaded twice: once before the
//! configuration file is parsed (to learn the config path itself) and once
//! after, with the `config` section available.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use clap::parser::ValueSource;
use color_eyre::{eyre::eyre, Result};
use indexmap::IndexMap;

struct OptDef {
	name: &'static str,
	env: &'static str,
	def: Option<&'static str>,
	hidden: bool,
}

macro_rules! opt {
	($name:literal, $env:literal, $def:literal) => {
		OptDef { name: $name, env: $env, def: Some($def), hidden: false }
	};
	($name:literal, $env:literal) => {
		OptDef { name: $name, env: $env, def: None, hidden: false }
	};
	(hidden $name:literal, $env:literal) => {
		OptDef { name: $name, env: $env, def: None, hidden: true }
	};
}

static OPTDEFS: &[OptDef] = &[
	opt!("loglevel", "GENIMAGE_LOGLEVEL", "1"),
	opt!("rootpath", "GENIMAGE_ROOTPATH", "root"),
	opt!("tmppath", "GENIMAGE_TMPPATH", "tmp"),
	opt!("inputpath", "GENIMAGE_INPUTPATH", "input"),
	opt!("outputpath", "GENIMAGE_OUTPUTPATH", "images"),
	opt!("includepath", "GENIMAGE_INCLUDEPATH"),
	opt!("config", "GENIMAGE_CONFIG", "genimage.cfg"),
	opt!(hidden "configdump", "GENIMAGE_CONFIGDUMP"),
	// external tool overrides
	opt!("cpio", "GENIMAGE_CPIO", "cpio"),
	opt!("dd", "GENIMAGE_DD", "dd"),
	opt!("debugfs", "GENIMAGE_DEBUGFS", "debugfs"),
	opt!("e2fsck", "GENIMAGE_E2FSCK", "e2fsck"),
	opt!("genext2fs", "GENIMAGE_GENEXT2FS", "genext2fs"),
	opt!("genisoimage", "GENIMAGE_GENISOIMAGE", "genisoimage"),
	opt!("mcopy", "GENIMAGE_MCOPY", "mcopy"),
	opt!("mmd", "GENIMAGE_MMD", "mmd"),
	opt!("mkcramfs", "GENIMAGE_MKCRAMFS", "mkcramfs"),
	opt!("mkdosfs", "GENIMAGE_MKDOSFS", "mkdosfs"),
	opt!("mke2fs", "GENIMAGE_MKE2FS", "mke2fs"),
	opt!("mkfsbtrfs", "GENIMAGE_MKFSBTRFS", "mkfs.btrfs"),
	opt!("mkfserofs", "GENIMAGE_MKFSEROFS", "mkfs.erofs"),
	opt!("mkfsf2fs", "GENIMAGE_MKFSF2FS", "mkfs.f2fs"),
	opt!("mkfsjffs2", "GENIMAGE_MKFJFFS2", "mkfs.jffs2"),
	opt!("mkfsubifs", "GENIMAGE_MKFSUBIFS", "mkfs.ubifs"),
	opt!("mkimage", "GENIMAGE_MKIMAGE", "mkimage"),
	opt!("mksquashfs", "GENIMAGE_MKSQUASHFS", "mksquashfs"),
	opt!("openssl", "GENIMAGE_OPENSSL", "openssl"),
	opt!("qemu-img", "GENIMAGE_QEMU", "qemu-img"),
	opt!("rauc", "GENIMAGE_RAUC", "rauc"),
	opt!("sloadf2fs", "GENIMAGE_SLOADF2FS", "sload.f2fs"),
	opt!("tar", "GENIMAGE_TAR", "tar"),
	opt!("tune2fs", "GENIMAGE_TUNE2FS", "tune2fs"),
	opt!("ubinize", "GENIMAGE_UBINIZE", "ubinize"),
	opt!("fiptool", "GENIMAGE_FIPTOOL", "fiptool"),
	opt!("veritysetup", "GENIMAGE_VERITYSETUP", "veritysetup"),
];

fn command() -> clap::Command {
	let mut cmd = clap::Command::new("genimage")
		.about("Generate filesystem, disk and flash images defined in the configuration file.")
		.version(env!("CARGO_PKG_VERSION"))
		.disable_version_flag(true)
		.arg(
			clap::Arg::new("version")
				.short('v')
				.long("version")
				.action(clap::ArgAction::Version)
				.help("Print version"),
		);
	for def in OPTDEFS {
		let mut arg = clap::Arg::new(def.name)
			.long(def.name)
			.value_name("arg")
			.num_args(1)
			.help(def.env);
		if let Some(d) = def.def {
			arg = arg.default_value(d).hide_default_value(true).help(format!(
				"[ {d} ]    ({env})",
				env = def.env
			));
		}
		if def.hidden {
			arg = arg.hide(true);
		}
		cmd = cmd.arg(arg);
	}
	cmd
}

/// The resolved option store plus the cached working paths.
#[derive(Debug)]
pub struct Opts {
	values: IndexMap<&'static str, String>,
	rootpath: PathBuf,
	tmppath: PathBuf,
	inputpath: PathBuf,
	imagepath: PathBuf,
	rootpath_enabled: bool,
}

fn abspath(path: &str) -> PathBuf {
	let p = Path::new(path);
	if p.is_absolute() {
		p.to_path_buf()
	} else {
		std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join(p)
	}
}

impl Opts {
	/// Build the store from `argv` and (on the second pass) the parsed
	/// `config { … }` section. `--help` and `--version` print and exit 0;
	/// unknown long options are an error.
	pub fn load(argv: &[OsString], cfg: Option<&IndexMap<String, String>>) -> Result<Self> {
		let matches = match command().try_get_matches_from(argv) {
			Ok(m) => m,
			Err(e)
				if matches!(
					e.kind(),
					clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
				) =>
			{
				let _ = e.print();
				std::process::exit(0);
			},
			Err(e) => return Err(eyre!("{e}")),
		};

		let mut values = IndexMap::new();
		for def in OPTDEFS {
			// 1) compiled default
			if let Some(d) = def.def {
				values.insert(def.name, d.to_owned());
			}
			// 2) environment
			if let Ok(v) = std::env::var(def.env) {
				values.insert(def.name, v);
			}
			// 3) config file section, when available
			if let Some(v) = cfg.and_then(|sec| sec.get(def.name)) {
				values.insert(def.name, v.clone());
			}
			// 4) command line
			if matches.value_source(def.name) == Some(ValueSource::CommandLine) {
				if let Some(v) = matches.get_one::<String>(def.name) {
					values.insert(def.name, v.clone());
				}
			}
		}

		let rootpath = abspath(values.get("rootpath").map_or("root", String::as_str));
		let tmppath = abspath(values.get("tmppath").map_or("tmp", String::as_str));
		let inputpath = abspath(values.get("inputpath").map_or("input", String::as_str));
		let imagepath = abspath(values.get("outputpath").map_or("images", String::as_str));

		Ok(Self { values, rootpath, tmppath, inputpath, imagepath, rootpath_enabled: true })
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.values.get(name).map(String::as_str)
	}

	/// Name of an external tool, honoring overrides.
	pub fn tool<'a>(&'a self, name: &'a str) -> &'a str {
		self.get(name).unwrap_or(name)
	}

	pub fn loglevel(&self) -> u8 {
		self.get("loglevel").and_then(|l| l.parse().ok()).unwrap_or(1)
	}

	/// Colon-delimited search path for `include` resolution.
	pub fn includepath(&self) -> Vec<PathBuf> {
		self.get("includepath")
			.map(|p| p.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect())
			.unwrap_or_default()
	}

	pub fn rootpath(&self) -> Option<&Path> {
		self.rootpath_enabled.then_some(self.rootpath.as_path())
	}

	pub fn tmppath(&self) -> &Path {
		&self.tmppath
	}

	pub fn inputpath(&self) -> &Path {
		&self.inputpath
	}

	/// The output directory (`outputpath` option, made absolute).
	pub fn imagepath(&self) -> &Path {
		&self.imagepath
	}

	/// Called when no image consumes the root tree; `rootpath()` then
	/// resolves to `None` and no staging tree is built.
	pub fn disable_rootpath(&mut self) {
		self.rootpath_enabled = false;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn argv(args: &[&str]) -> Vec<OsString> {
		std::iter::once("genimage").chain(args.iter().copied()).map(OsString::from).collect()
	}

	#[test]
	fn defaults_apply() {
		let opts = Opts::load(&argv(&[]), None).unwrap();
		assert_eq!(opts.get("config"), Some("genimage.cfg"));
		assert_eq!(opts.get("mksquashfs"), Some("mksquashfs"));
		assert_eq!(opts.loglevel(), 1);
	}

	#[test]
	fn command_line_overrides_config_section() {
		let mut sec = IndexMap::new();
		sec.insert("loglevel".to_owned(), "3".to_owned());
		sec.insert("mksquashfs".to_owned(), "/opt/bin/mksquashfs".to_owned());
		let opts = Opts::load(&argv(&["--loglevel", "2"]), Some(&sec)).unwrap();
		assert_eq!(opts.loglevel(), 2);
		assert_eq!(opts.tool("mksquashfs"), "/opt/bin/mksquashfs");
	}

	#[test]
	fn unknown_flag_is_an_error() {
		assert!(Opts::load(&argv(&["--no-such-option", "x"]), None).is_err());
	}

	#[test]
	fn reload_is_idempotent() {
		let a = Opts::load(&argv(&["--loglevel", "2"]), None).unwrap();
		let b = Opts::load(&argv(&["--loglevel", "2"]), None).unwrap();
		assert_eq!(a.values, b.values);
	}

	#[test]
	fn includepath_splits_on_colon() {
		let mut sec = IndexMap::new();
		sec.insert("includepath".to_owned(), "/a:/b/c".to_owned());
		let opts = Opts::load(&argv(&[]), Some(&sec)).unwrap();
		assert_eq!(opts.includepath(), vec![PathBuf::from("/a"), PathBuf::from("/b/c")]);
	}
}
