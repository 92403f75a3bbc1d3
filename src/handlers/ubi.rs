use std::fmt::Write as _;

use color_eyre::{eyre::bail, Result};
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{child, finalize_size, split_args, Handler};
use crate::image::{Child, Context, Image};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct UbiOpts {
	pub extraargs: Option<String>,
}

pub struct Ubi {
	opts: UbiOpts,
}

impl Ubi {
	#[must_use]
	pub fn new(opts: UbiOpts) -> Self {
		Self { opts }
	}

	/// The ubinize volume description, one section per partition.
	fn volume_ini(image: &Image, children: &[Option<Child>]) -> Result<String> {
		let mut ini = String::new();
		for (vol_id, part) in image.partitions.iter().enumerate() {
			let name = part
				.image
				.as_deref()
				.ok_or_else(|| color_eyre::eyre::eyre!("{}: volume {} has no image", image.tag(), part.name))?;
			let source = child(image, children, name)?;
			writeln!(ini, "[{}]", part.name)?;
			writeln!(ini, "mode=ubi")?;
			writeln!(ini, "image={}", source.outfile.display())?;
			writeln!(ini, "vol_id={vol_id}")?;
			writeln!(ini, "vol_size={}", source.size)?;
			writeln!(ini, "vol_type=dynamic")?;
			writeln!(ini, "vol_name={}", part.name)?;
			writeln!(ini, "autoresize={}", part.autoresize)?;
			writeln!(ini, "vol_alignment=1")?;
		}
		Ok(ini)
	}
}

impl Handler for Ubi {
	fn ty(&self) -> &'static str {
		"ubi"
	}

	fn setup(&mut self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		ctx.flash_type(image)?;
		let autoresize = image.partitions.iter().filter(|p| p.autoresize).count();
		if autoresize > 1 {
			bail!("{}: more than one volume has the autoresize flag set", image.tag());
		}
		Ok(())
	}

	fn generate(&self, ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		let ft = ctx.flash_type(image)?;
		let ini = Self::volume_ini(image, children)?;
		let ini_file = ctx.opts.tmppath().join("ubifs.ini");
		std::fs::write(&ini_file, ini)?;

		let mut cmd = exec::tool(ctx.opts.tool("ubinize"));
		cmd.args(["-s", &ft.sub_page_size.bytes.to_string()])
			.args(["-O", &ft.vid_header_offset.bytes.to_string()])
			.args(["-p", &ft.pebsize.bytes.to_string()])
			.args(["-m", &ft.minimum_io_unit_size.bytes.to_string()])
			.arg("-o")
			.arg(&image.outfile)
			.arg(&ini_file)
			.args(split_args(&self.opts.extraargs));
		exec::run(&mut cmd)?;
		finalize_size(image)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::image::Partition;

	#[test]
	fn ini_lists_volumes_in_order() {
		let mut image = Image::blank();
		image.file = "nand.ubi".to_owned();
		image.partitions = vec![
			Partition {
				name: "rootfs".to_owned(),
				image: Some("root.ubifs".to_owned()),
				..Partition::default()
			},
			Partition {
				name: "data".to_owned(),
				image: Some("data.ubifs".to_owned()),
				autoresize: true,
				..Partition::default()
			},
		];
		let children = vec![
			Some(Child {
				file: "root.ubifs".to_owned(),
				size: 1024,
				outfile: "/out/root.ubifs".into(),
				holes: Vec::new(),
			}),
			Some(Child {
				file: "data.ubifs".to_owned(),
				size: 2048,
				outfile: "/out/data.ubifs".into(),
				holes: Vec::new(),
			}),
		];
		let ini = Ubi::volume_ini(&image, &children).unwrap();
		assert!(ini.starts_with("[rootfs]\n"));
		assert!(ini.contains("vol_id=0"));
		assert!(ini.contains("image=/out/root.ubifs"));
		assert!(ini.contains("[data]\n"));
		assert!(ini.contains("vol_id=1"));
		assert!(ini.contains("vol_size=2048"));
		assert!(ini.contains("autoresize=true"));
	}
}
