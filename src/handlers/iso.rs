use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{finalize_size, split_args, Handler};
use crate::image::{Child, Context, Image};

fn default_bootargs() -> String {
	"-no-emul-boot -boot-load-size 4 -boot-info-table -c boot.cat -hide boot.cat".to_owned()
}

fn default_charset() -> String {
	"default".to_owned()
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct IsoOpts {
	pub boot_image: Option<String>,
	#[serde(default = "default_bootargs")]
	pub bootargs: String,
	pub extraargs: Option<String>,
	#[serde(default = "default_charset")]
	pub input_charset: String,
	#[serde(default)]
	pub volume_id: String,
}

impl Default for IsoOpts {
	fn default() -> Self {
		Self {
			boot_image: None,
			bootargs: default_bootargs(),
			extraargs: None,
			input_charset: default_charset(),
			volume_id: String::new(),
		}
	}
}

pub struct Iso {
	opts: IsoOpts,
}

impl Iso {
	#[must_use]
	pub fn new(opts: IsoOpts) -> Self {
		Self { opts }
	}
}

impl Handler for Iso {
	fn ty(&self) -> &'static str {
		"iso"
	}

	fn generate(&self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		let src = image.srcdir()?;
		let mut cmd = exec::tool(ctx.opts.tool("genisoimage"));
		cmd.args(["-input-charset", &self.opts.input_charset]).args(["-R", "-hide-rr-moved"]);
		if let Some(boot) = &self.opts.boot_image {
			cmd.args(["-b", boot]);
			cmd.args(self.opts.bootargs.split_whitespace());
		}
		cmd.args(["-V", &self.opts.volume_id]);
		cmd.args(split_args(&self.opts.extraargs));
		cmd.arg("-o").arg(&image.outfile).arg(src);
		exec::run(&mut cmd)?;
		finalize_size(image)
	}
}
