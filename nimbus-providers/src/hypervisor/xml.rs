//! Domain descriptor synthesis and the few fields read back from `dumpxml`.

use minijinja::{context, AutoEscape, Environment};
use roxmltree::Document;

use crate::error::{BackendError, BackendResult};

const DOMAIN_TEMPLATE: &str = r#"<domain type='kvm'>
  <name>{{ name|x }}</name>
  <memory unit='KiB'>{{ memory_kib }}</memory>
  <currentMemory unit='KiB'>{{ memory_kib }}</currentMemory>
  <vcpu placement='static'>{{ cpus }}</vcpu>
  <os>
{% if microvm %}
    <type arch='x86_64' machine='microvm'>hvm</type>
    <kernel>{{ kernel|x }}</kernel>
    <cmdline>console=ttyS0 root=/dev/vda rw</cmdline>
{% else %}
    <type arch='x86_64' machine='pc'>hvm</type>
    <boot dev='hd'/>
{% endif %}
  </os>
{% if not microvm %}
  <features>
    <acpi/>
    <apic/>
  </features>
{% endif %}
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{{ disk_path|x }}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='{{ network|x }}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
{% if not microvm %}
    <graphics type='vnc' port='-1' autoport='yes' listen='127.0.0.1'/>
{% endif %}
  </devices>
</domain>
"#;

/// Machine flavour the adapter defines domains with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineProfile {
    Standard,
    /// `microvm` machine type: direct kernel boot, no graphics device.
    MicroVm { kernel: String },
}

#[derive(Debug, Clone)]
pub struct DomainSpec<'a> {
    pub name: &'a str,
    pub cpus: u32,
    pub memory_kib: u64,
    pub disk_path: &'a str,
    pub network: &'a str,
    pub profile: &'a MachineProfile,
}

fn xml_escape(value: String) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn render_domain(spec: &DomainSpec<'_>) -> BackendResult<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.add_filter("x", xml_escape);
    env.add_template("domain", DOMAIN_TEMPLATE)
        .map_err(|e| BackendError::Rejected(format!("domain template: {e}")))?;
    let (microvm, kernel) = match spec.profile {
        MachineProfile::Standard => (false, ""),
        MachineProfile::MicroVm { kernel } => (true, kernel.as_str()),
    };
    env.get_template("domain")
        .and_then(|t| {
            t.render(context! {
                name => spec.name,
                cpus => spec.cpus,
                memory_kib => spec.memory_kib,
                disk_path => spec.disk_path,
                network => spec.network,
                microvm => microvm,
                kernel => kernel,
            })
        })
        .map_err(|e| BackendError::Rejected(format!("domain template: {e}")))
}

fn parse(xml: &str) -> BackendResult<Document<'_>> {
    Document::parse(xml).map_err(|e| BackendError::Rejected(format!("domain xml: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub mac: String,
    pub network: String,
}

/// First NIC of the domain: its MAC and the network it is plugged into.
pub fn parse_interface(xml: &str) -> BackendResult<InterfaceInfo> {
    let doc = parse(xml)?;
    let iface = doc
        .descendants()
        .find(|n| n.has_tag_name("interface"))
        .ok_or_else(|| BackendError::NotFound("domain interface".into()))?;
    let mac = iface
        .children()
        .find(|c| c.has_tag_name("mac"))
        .and_then(|c| c.attribute("address"))
        .ok_or_else(|| BackendError::NotFound("interface mac".into()))?;
    let network = iface
        .children()
        .find(|c| c.has_tag_name("source"))
        .and_then(|c| c.attribute("network").or_else(|| c.attribute("bridge")))
        .unwrap_or("default");
    Ok(InterfaceInfo {
        mac: mac.to_ascii_lowercase(),
        network: network.to_string(),
    })
}

/// `vnc://127.0.0.1:P` for an assigned VNC port.
pub fn parse_console_url(xml: &str) -> BackendResult<String> {
    let doc = parse(xml)?;
    let graphics = doc
        .descendants()
        .find(|n| n.has_tag_name("graphics"))
        .ok_or_else(|| BackendError::Unsupported("domain has no graphics device".into()))?;
    if graphics.attribute("type") != Some("vnc") {
        return Err(BackendError::Unsupported(format!(
            "graphics type {:?}",
            graphics.attribute("type").unwrap_or("")
        )));
    }
    match graphics.attribute("port").and_then(|p| p.parse::<i32>().ok()) {
        Some(port) if port > 0 => Ok(format!("vnc://127.0.0.1:{port}")),
        _ => Err(BackendError::NotFound("vnc port".into())),
    }
}

/// Disk (source path, target dev) pairs.
pub fn parse_disks(xml: &str) -> BackendResult<Vec<(String, String)>> {
    let doc = parse(xml)?;
    Ok(doc
        .descendants()
        .filter(|n| n.has_tag_name("disk"))
        .filter_map(|disk| {
            let source = disk
                .children()
                .find(|c| c.has_tag_name("source"))
                .and_then(|c| c.attribute("file"))?;
            let target = disk
                .children()
                .find(|c| c.has_tag_name("target"))
                .and_then(|c| c.attribute("dev"))?;
            Some((source.to_string(), target.to_string()))
        })
        .collect())
}

/// First unused virtio target (vdb..vdz).
pub fn next_disk_target(xml: &str) -> BackendResult<String> {
    let used: Vec<String> = parse_disks(xml)?.into_iter().map(|(_, t)| t).collect();
    (b'b'..=b'z')
        .map(|c| format!("vd{}", c as char))
        .find(|dev| !used.contains(dev))
        .ok_or_else(|| BackendError::Rejected("no free disk target".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"<domain type='kvm' id='3'>
  <name>web</name>
  <devices>
    <disk type='file' device='disk'>
      <source file='/var/lib/libvirt/images/web-root'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <mac address='52:54:00:AB:cd:01'/>
      <source network='tenant-a'/>
      <model type='virtio'/>
    </interface>
    <graphics type='vnc' port='5901' autoport='yes' listen='127.0.0.1'/>
  </devices>
</domain>"#;

    #[test]
    fn standard_domain_has_vnc_and_virtio_disk() {
        let xml = render_domain(&DomainSpec {
            name: "web",
            cpus: 2,
            memory_kib: 1024 * 1024,
            disk_path: "/pool/web-root",
            network: "default",
            profile: &MachineProfile::Standard,
        })
        .unwrap();
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
        assert!(xml.contains("<source file='/pool/web-root'/>"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        assert!(xml.contains("<graphics type='vnc'"));
        assert!(xml.contains("machine='pc'"));
        assert!(Document::parse(&xml).is_ok());
    }

    #[test]
    fn microvm_domain_has_no_graphics() {
        let profile = MachineProfile::MicroVm {
            kernel: "/boot/vmlinux".into(),
        };
        let xml = render_domain(&DomainSpec {
            name: "fn",
            cpus: 1,
            memory_kib: 512 * 1024,
            disk_path: "/pool/fn-root",
            network: "default",
            profile: &profile,
        })
        .unwrap();
        assert!(xml.contains("machine='microvm'"));
        assert!(xml.contains("<kernel>/boot/vmlinux</kernel>"));
        assert!(!xml.contains("<graphics"));
    }

    #[test]
    fn reads_back_dump_fields() {
        let iface = parse_interface(DUMP).unwrap();
        assert_eq!(iface.mac, "52:54:00:ab:cd:01");
        assert_eq!(iface.network, "tenant-a");
        assert_eq!(parse_console_url(DUMP).unwrap(), "vnc://127.0.0.1:5901");
        assert_eq!(next_disk_target(DUMP).unwrap(), "vdb");
    }

    #[test]
    fn autoport_not_yet_assigned() {
        let xml = "<domain><devices><graphics type='vnc' port='-1'/></devices></domain>";
        assert!(matches!(parse_console_url(xml), Err(BackendError::NotFound(_))));
    }
}
