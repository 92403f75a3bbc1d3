use color_eyre::{eyre::bail, Result};
use serde::{Deserialize, Serialize};

use crate::config::Size;
use crate::exec;
use crate::handlers::{finalize_size, split_args, Handler};
use crate::image::{Child, Context, Image};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct UbifsOpts {
	pub extraargs: Option<String>,
	/// Upper bound for the filesystem; defaults to the image size.
	#[serde(default)]
	pub max_size: Size,
}

pub struct Ubifs {
	opts: UbifsOpts,
}

impl Ubifs {
	#[must_use]
	pub fn new(opts: UbifsOpts) -> Self {
		Self { opts }
	}
}

impl Handler for Ubifs {
	fn ty(&self) -> &'static str {
		"ubifs"
	}

	fn setup(&mut self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		let ft = ctx.flash_type(image)?;
		if ft.lebsize.bytes == 0 {
			bail!("{}: flash type has no lebsize", image.tag());
		}
		if self.opts.max_size.is_zero() && image.size == 0 {
			bail!("{}: neither size nor max-size given", image.tag());
		}
		Ok(())
	}

	fn generate(&self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		let ft = ctx.flash_type(image)?;
		let lebsize = ft.lebsize.bytes;
		let max_size =
			if self.opts.max_size.is_zero() { image.size } else { self.opts.max_size.bytes };
		let max_leb_cnt = max_size / lebsize;
		let src = image.srcdir()?;

		let mut cmd = exec::tool(ctx.opts.tool("mkfsubifs"));
		cmd.arg("-d")
			.arg(src)
			.args(["-e", &lebsize.to_string()])
			.args(["-m", &ft.minimum_io_unit_size.bytes.to_string()])
			.args(["-c", &max_leb_cnt.to_string()])
			.arg("-o")
			.arg(&image.outfile)
			.args(split_args(&self.opts.extraargs));
		exec::run(&mut cmd)?;
		finalize_size(image)
	}
}
