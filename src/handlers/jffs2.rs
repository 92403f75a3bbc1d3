use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{finalize_size, split_args, Handler};
use crate::image::{Child, Context, Image};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Jffs2Opts {
	pub extraargs: Option<String>,
}

pub struct Jffs2 {
	opts: Jffs2Opts,
}

impl Jffs2 {
	#[must_use]
	pub fn new(opts: Jffs2Opts) -> Self {
		Self { opts }
	}
}

impl Handler for Jffs2 {
	fn ty(&self) -> &'static str {
		"jffs2"
	}

	fn setup(&mut self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		ctx.flash_type(image).map(drop)
	}

	fn generate(&self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		let ft = ctx.flash_type(image)?;
		let src = image.srcdir()?;
		let mut cmd = exec::tool(ctx.opts.tool("mkfsjffs2"));
		cmd.arg(format!("--eraseblock={}", ft.pebsize.bytes))
			.arg("-d")
			.arg(src)
			.arg("-o")
			.arg(&image.outfile)
			.args(split_args(&self.opts.extraargs));
		exec::run(&mut cmd)?;
		finalize_size(image)
	}
}
