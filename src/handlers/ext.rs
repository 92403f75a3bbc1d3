//! ext2/ext3/ext4 via genext2fs, tune2fs and e2fsck.

use color_eyre::{eyre::bail, Result};
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{split_args, Handler};
use crate::image::{Child, Context, Image};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ExtOpts {
	pub extraargs: Option<String>,
	/// Feature set passed to tune2fs; each type has its own default.
	pub features: Option<String>,
	pub label: Option<String>,
	pub fs_timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtKind {
	Ext2,
	Ext3,
	Ext4,
}

impl ExtKind {
	const fn ty(self) -> &'static str {
		match self {
			Self::Ext2 => "ext2",
			Self::Ext3 => "ext3",
			Self::Ext4 => "ext4",
		}
	}

	const fn default_features(self) -> &'static str {
		match self {
			Self::Ext2 => "",
			Self::Ext3 => "has_journal",
			Self::Ext4 => "extents,uninit_bg,dir_index,has_journal",
		}
	}
}

pub struct Ext {
	kind: ExtKind,
	opts: ExtOpts,
}

impl Ext {
	#[must_use]
	pub fn new(kind: ExtKind, opts: ExtOpts) -> Self {
		Self { kind, opts }
	}
}

impl Handler for Ext {
	fn ty(&self) -> &'static str {
		self.kind.ty()
	}

	fn setup(&mut self, _ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		if image.size == 0 {
			bail!("{}: no size given or must not be zero", image.tag());
		}
		Ok(())
	}

	fn generate(&self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		let mut cmd = exec::tool(ctx.opts.tool("genext2fs"));
		if let Ok(src) = image.srcdir() {
			cmd.arg("-d").arg(src);
		}
		cmd.arg(format!("--size-in-blocks={}", image.size / 1024)).args(["-i", "16384"]);
		cmd.args(split_args(&self.opts.extraargs));
		cmd.arg(&image.outfile);
		exec::run(&mut cmd)?;

		let features =
			self.opts.features.clone().unwrap_or_else(|| self.kind.default_features().to_owned());
		if !features.is_empty() {
			exec::run(exec::tool(ctx.opts.tool("tune2fs")).args(["-O", &features]).arg(&image.outfile))?;
		}
		if let Some(label) = self.opts.label.as_deref().filter(|l| !l.is_empty()) {
			exec::run(exec::tool(ctx.opts.tool("tune2fs")).args(["-L", label]).arg(&image.outfile))?;
		}

		// e2fsck returns 1 when it successfully modified the filesystem
		exec::run_ok_codes(
			exec::tool(ctx.opts.tool("e2fsck")).arg("-pvfD").arg(&image.outfile),
			&[0, 1, 2],
		)?;

		if let Some(ts) = &self.opts.fs_timestamp {
			let script = format!(
				"set_current_time {ts}\n\
				 set_super_value mkfs_time {ts}\n\
				 set_super_value lastcheck {ts}\n\
				 set_super_value mtime 00000000\n"
			);
			exec::run_with_stdin(
				exec::tool(ctx.opts.tool("debugfs")).arg("-w").arg(&image.outfile),
				script.as_bytes(),
			)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn size_is_mandatory() {
		let mut image = Image::blank();
		image.file = "root.ext4".to_owned();
		let argv = vec![std::ffi::OsString::from("genimage")];
		let ctx = Context {
			opts: crate::opts::Opts::load(&argv, None).unwrap(),
			flash_types: indexmap::IndexMap::new(),
			mdraid: std::cell::RefCell::default(),
		};
		let mut h = Ext::new(ExtKind::Ext4, ExtOpts::default());
		assert!(h.setup(&ctx, &mut image, &[]).is_err());
	}

	#[test]
	fn per_type_feature_defaults() {
		assert_eq!(ExtKind::Ext2.default_features(), "");
		assert_eq!(ExtKind::Ext3.default_features(), "has_journal");
		assert!(ExtKind::Ext4.default_features().contains("has_journal"));
	}
}
