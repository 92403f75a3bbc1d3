use color_eyre::{eyre::bail, Result};
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{finalize_size, split_args, Handler};
use crate::image::{Child, Context, Image};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ErofsOpts {
	pub extraargs: Option<String>,
	pub label: Option<String>,
	pub fs_timestamp: Option<String>,
}

pub struct Erofs {
	opts: ErofsOpts,
}

impl Erofs {
	#[must_use]
	pub fn new(opts: ErofsOpts) -> Self {
		Self { opts }
	}
}

impl Handler for Erofs {
	fn ty(&self) -> &'static str {
		"erofs"
	}

	fn setup(&mut self, _ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		if let Some(label) = self.opts.label.as_deref().filter(|l| !l.is_empty()) {
			if label.len() > 15 {
				bail!("{}: label '{label}' is longer than allowed (15 bytes)", image.tag());
			}
		}
		Ok(())
	}

	fn generate(&self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		let src = image.srcdir()?;
		let mut cmd = exec::tool(ctx.opts.tool("mkfserofs"));
		if let Some(label) = self.opts.label.as_deref().filter(|l| !l.is_empty()) {
			cmd.args(["-L", label]);
		}
		if let Some(ts) = &self.opts.fs_timestamp {
			cmd.args(["-T", ts]);
		}
		cmd.args(split_args(&self.opts.extraargs));
		cmd.arg(&image.outfile).arg(src);
		exec::run(&mut cmd)?;
		finalize_size(image)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn long_label_rejected() {
		let mut image = Image::blank();
		image.file = "root.erofs".to_owned();
		let argv = vec![std::ffi::OsString::from("genimage")];
		let ctx = Context {
			opts: crate::opts::Opts::load(&argv, None).unwrap(),
			flash_types: indexmap::IndexMap::new(),
			mdraid: std::cell::RefCell::default(),
		};
		let mut h = Erofs::new(ErofsOpts {
			label: Some("a-very-long-volume-label".to_owned()),
			..ErofsOpts::default()
		});
		assert!(h.setup(&ctx, &mut image, &[]).is_err());
	}
}
