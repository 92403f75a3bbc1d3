use color_eyre::{eyre::bail, Result};
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::Handler;
use crate::image::{Child, Context, Image};
use crate::io;

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct CustomOpts {
	/// Command producing `$IMAGEOUTFILE`.
	pub exec: Option<String>,
}

pub struct Custom {
	opts: CustomOpts,
}

impl Custom {
	#[must_use]
	pub fn new(opts: CustomOpts) -> Self {
		Self { opts }
	}
}

impl Handler for Custom {
	fn ty(&self) -> &'static str {
		"custom"
	}

	fn parse(&mut self, image: &mut Image) -> Result<()> {
		if image.mountpoint.as_deref().unwrap_or_default().is_empty() {
			image.empty = true;
		}
		Ok(())
	}

	fn setup(&mut self, _ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		if self.opts.exec.as_deref().unwrap_or_default().is_empty() {
			bail!("{}: mandatory option 'exec' is missing", image.tag());
		}
		Ok(())
	}

	fn generate(&self, _ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		io::prepare_image(&image.outfile, image.size)?;
		let Some(exec_cmd) = self.opts.exec.as_deref() else {
			bail!("{}: mandatory option 'exec' is missing", image.tag());
		};
		exec::run_script(exec_cmd)?;
		let meta = std::fs::metadata(&image.outfile).map_err(|e| {
			color_eyre::eyre::eyre!(
				"{}: command '{exec_cmd}' failed to create '{}': {e}",
				image.tag(),
				image.outfile.display()
			)
		})?;
		if image.size == 0 {
			image.size = meta.len();
		}
		Ok(())
	}
}
