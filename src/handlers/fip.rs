//! ARM Trusted Firmware FIP images via fiptool.

use color_eyre::{eyre::bail, Result};
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{child, finalize_size, split_args, Handler};
use crate::image::{Child, Context, Image, Partition};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct FipOpts {
	pub extraargs: Option<String>,
	/// Secure payload BL32 plus up to two extra binaries.
	#[serde(default)]
	pub tos_fw: Vec<String>,
	pub scp_fwu_cfg: Option<String>,
	pub ap_fwu_cfg: Option<String>,
	pub fwu: Option<String>,
	pub fwu_cert: Option<String>,
	pub tb_fw: Option<String>,
	pub scp_fw: Option<String>,
	pub soc_fw: Option<String>,
	pub nt_fw: Option<String>,
	pub fw_config: Option<String>,
	pub hw_config: Option<String>,
	pub tb_fw_config: Option<String>,
	pub soc_fw_config: Option<String>,
	pub tos_fw_config: Option<String>,
	pub nt_fw_config: Option<String>,
	pub rot_cert: Option<String>,
	pub trusted_key_cert: Option<String>,
	pub scp_fw_key_cert: Option<String>,
	pub soc_fw_key_cert: Option<String>,
	pub tos_fw_key_cert: Option<String>,
	pub nt_fw_key_cert: Option<String>,
	pub tb_fw_cert: Option<String>,
	pub scp_fw_cert: Option<String>,
	pub soc_fw_cert: Option<String>,
	pub tos_fw_cert: Option<String>,
	pub nt_fw_cert: Option<String>,
	pub sip_sp_cert: Option<String>,
	pub plat_sp_cert: Option<String>,
}

const TOS_FW_NAMES: [&str; 3] = ["tos-fw", "tos-fw-extra1", "tos-fw-extra2"];

impl FipOpts {
	/// fiptool option name and configured path for every simple entry.
	fn entries(&self) -> Vec<(&'static str, &Option<String>)> {
		vec![
			("scp-fwu-cfg", &self.scp_fwu_cfg),
			("ap-fwu-cfg", &self.ap_fwu_cfg),
			("fwu", &self.fwu),
			("fwu-cert", &self.fwu_cert),
			("tb-fw", &self.tb_fw),
			("scp-fw", &self.scp_fw),
			("soc-fw", &self.soc_fw),
			("nt-fw", &self.nt_fw),
			("fw-config", &self.fw_config),
			("hw-config", &self.hw_config),
			("tb-fw-config", &self.tb_fw_config),
			("soc-fw-config", &self.soc_fw_config),
			("tos-fw-config", &self.tos_fw_config),
			("nt-fw-config", &self.nt_fw_config),
			("rot-cert", &self.rot_cert),
			("trusted-key-cert", &self.trusted_key_cert),
			("scp-fw-key-cert", &self.scp_fw_key_cert),
			("soc-fw-key-cert", &self.soc_fw_key_cert),
			("tos-fw-key-cert", &self.tos_fw_key_cert),
			("nt-fw-key-cert", &self.nt_fw_key_cert),
			("tb-fw-cert", &self.tb_fw_cert),
			("scp-fw-cert", &self.scp_fw_cert),
			("soc-fw-cert", &self.soc_fw_cert),
			("tos-fw-cert", &self.tos_fw_cert),
			("nt-fw-cert", &self.nt_fw_cert),
			("sip-sp-cert", &self.sip_sp_cert),
			("plat-sp-cert", &self.plat_sp_cert),
		]
	}
}

pub struct Fip {
	opts: FipOpts,
}

impl Fip {
	#[must_use]
	pub fn new(opts: FipOpts) -> Self {
		Self { opts }
	}
}

impl Handler for Fip {
	fn ty(&self) -> &'static str {
		"fip"
	}

	fn no_rootpath(&self) -> bool {
		true
	}

	fn parse(&mut self, image: &mut Image) -> Result<()> {
		if self.opts.tos_fw.len() > TOS_FW_NAMES.len() {
			bail!(
				"{}: {} tos-fw binaries given, but maximum is {}",
				image.tag(),
				self.opts.tos_fw.len(),
				TOS_FW_NAMES.len()
			);
		}
		let mut add = |name: &str, path: &str| {
			image.partitions.push(Partition {
				name: name.to_owned(),
				image: Some(path.to_owned()),
				in_partition_table: false,
				..Partition::default()
			});
		};
		for (name, path) in TOS_FW_NAMES.iter().zip(&self.opts.tos_fw) {
			add(name, path);
		}
		for (name, path) in self.opts.entries() {
			if let Some(path) = path {
				add(name, path);
			}
		}
		Ok(())
	}

	fn generate(&self, ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		let mut cmd = exec::tool(ctx.opts.tool("fiptool"));
		cmd.arg("create");
		for part in &image.partitions {
			let Some(name) = &part.image else { continue };
			let source = child(image, children, name)?;
			cmd.arg(format!("--{}", part.name)).arg(&source.outfile);
		}
		cmd.args(split_args(&self.opts.extraargs));
		cmd.arg(&image.outfile);
		exec::run(&mut cmd)?;
		finalize_size(image)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tos_fw_slots_are_named() {
		let mut image = Image::blank();
		let mut h = Fip::new(FipOpts {
			tos_fw: vec!["bl32.bin".to_owned(), "bl32-extra.bin".to_owned()],
			soc_fw: Some("bl31.bin".to_owned()),
			..FipOpts::default()
		});
		h.parse(&mut image).unwrap();
		let names: Vec<&str> = image.partitions.iter().map(|p| p.name.as_str()).collect();
		assert_eq!(names, vec!["tos-fw", "tos-fw-extra1", "soc-fw"]);
	}

	#[test]
	fn too_many_tos_fw_rejected() {
		let mut image = Image::blank();
		let mut h = Fip::new(FipOpts {
			tos_fw: vec!["a".into(), "b".into(), "c".into(), "d".into()],
			..FipOpts::default()
		});
		assert!(h.parse(&mut image).is_err());
	}
}
