use color_eyre::{eyre::bail, Result};
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{split_args, Handler};
use crate::image::{Child, Context, Image};
use crate::io;

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct BtrfsOpts {
	pub label: Option<String>,
	pub extraargs: Option<String>,
}

pub struct Btrfs {
	opts: BtrfsOpts,
}

impl Btrfs {
	#[must_use]
	pub fn new(opts: BtrfsOpts) -> Self {
		Self { opts }
	}
}

impl Handler for Btrfs {
	fn ty(&self) -> &'static str {
		"btrfs"
	}

	fn generate(&self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		io::prepare_image(&image.outfile, image.size)?;

		let mut cmd = exec::tool(ctx.opts.tool("mkfsbtrfs"));
		if let Some(label) = &self.opts.label {
			cmd.args(["-L", label]);
		}
		if let Ok(src) = image.srcdir() {
			cmd.arg("-r").arg(src);
		}
		cmd.args(split_args(&self.opts.extraargs));
		cmd.arg(&image.outfile);
		exec::run(&mut cmd)?;

		let actual = std::fs::metadata(&image.outfile)?.len();
		if image.size != 0 && actual > image.size {
			bail!(
				"{}: created image is bigger than the configured size ({actual} > {})",
				image.tag(),
				image.size
			);
		}
		if image.size == 0 {
			image.size = actual;
		}
		Ok(())
	}
}
