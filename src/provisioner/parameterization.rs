// src/provisioner/parameterization.rs
// Renders the guest-bootstrap payloads: cloud-init user-data for Linux,
// cloudbase-init ConfigDrive documents for Windows templates, and an
// autounattend XML for bare-ISO Windows installs.

use crate::errors::{DomeError, DomeResult};
use crate::model::{StaticIpConfig, VmSpec};

/// cloud-init user-data. The SSH public key is mandatory: password auth is
/// disabled in the base images, so a keyless payload would produce an
/// unreachable VM.
pub fn cloud_init_user_data(
    spec: &VmSpec,
    ssh_public_key: &str,
    static_ip: Option<&StaticIpConfig>,
    install_guest_agent: bool,
) -> DomeResult<String> {
    if ssh_public_key.trim().is_empty() {
        return Err(DomeError::validation(format!(
            "vm '{}' has no ssh public key; cloud-init templates disable password auth",
            spec.name
        )));
    }

    let mut doc = String::from("#cloud-config\n");
    doc.push_str(&format!("hostname: {}\n", spec.name));
    doc.push_str("users:\n");
    doc.push_str(&format!("  - name: {}\n", spec.credentials.username));
    doc.push_str("    sudo: ALL=(ALL) NOPASSWD:ALL\n");
    doc.push_str("    shell: /bin/bash\n");
    doc.push_str("    ssh_authorized_keys:\n");
    doc.push_str(&format!("      - {}\n", ssh_public_key.trim()));

    let mut packages = vec![];
    if install_guest_agent {
        packages.push("qemu-guest-agent");
    }
    if !packages.is_empty() {
        doc.push_str("packages:\n");
        for package in &packages {
            doc.push_str(&format!("  - {package}\n"));
        }
        doc.push_str("runcmd:\n");
        doc.push_str("  - systemctl enable --now qemu-guest-agent\n");
    }

    if let Some(ip) = static_ip {
        doc.push_str("write_files:\n");
        doc.push_str("  - path: /etc/netplan/90-glassdome.yaml\n");
        doc.push_str("    content: |\n");
        doc.push_str("      network:\n");
        doc.push_str("        version: 2\n");
        doc.push_str("        ethernets:\n");
        doc.push_str("          primary:\n");
        doc.push_str("            match: { name: \"e*\" }\n");
        doc.push_str(&format!("            addresses: [{}]\n", ip.address));
        doc.push_str(&format!("            gateway4: {}\n", ip.gateway));
        if !ip.nameservers.is_empty() {
            doc.push_str(&format!(
                "            nameservers: {{ addresses: [{}] }}\n",
                ip.nameservers.join(", ")
            ));
        }
    }

    Ok(doc)
}

/// ConfigDrive `meta_data.json` for cloudbase-init.
pub fn cloudbase_meta_data(spec: &VmSpec, admin_username: &str) -> String {
    serde_json::json!({
        "uuid": format!("glassdome-{}", spec.name),
        "hostname": spec.name,
        "name": spec.name,
        "admin_username": admin_username,
    })
    .to_string()
}

/// ConfigDrive `user_data`: a first-boot script that opens RDP and applies
/// static addressing when required.
pub fn cloudbase_user_data(static_ip: Option<&StaticIpConfig>) -> String {
    let mut script = String::from("#ps1_sysnative\n");
    script.push_str(
        "Set-ItemProperty -Path 'HKLM:\\System\\CurrentControlSet\\Control\\Terminal Server' -Name fDenyTSConnections -Value 0\n",
    );
    script.push_str("Enable-NetFirewallRule -DisplayGroup 'Remote Desktop'\n");
    if let Some(ip) = static_ip {
        let (address, prefix) = ip
            .address
            .split_once('/')
            .unwrap_or((ip.address.as_str(), "24"));
        script.push_str(&format!(
            "New-NetIPAddress -InterfaceAlias Ethernet -IPAddress {address} -PrefixLength {prefix} -DefaultGateway {}\n",
            ip.gateway
        ));
        if !ip.nameservers.is_empty() {
            script.push_str(&format!(
                "Set-DnsClientServerAddress -InterfaceAlias Ethernet -ServerAddresses {}\n",
                ip.nameservers.join(",")
            ));
        }
    }
    script
}

/// cloudbase-init.conf selecting the ConfigDrive service and the plugin set
/// the image relies on.
pub fn cloudbase_conf() -> String {
    [
        "[DEFAULT]",
        "username=Admin",
        "inject_user_password=true",
        "first_logon_behaviour=no",
        "metadata_services=cloudbaseinit.metadata.services.configdrive.ConfigDriveService",
        "plugins=cloudbaseinit.plugins.common.users.CreateUserPlugin,",
        "        cloudbaseinit.plugins.common.setuserpassword.SetUserPasswordPlugin,",
        "        cloudbaseinit.plugins.common.networkconfig.NetworkConfigPlugin,",
        "        cloudbaseinit.plugins.windows.licensing.WindowsLicensingPlugin,",
        "        cloudbaseinit.plugins.common.sshpublickeys.SetUserSSHPublicKeysPlugin",
        "allow_reboot=true",
        "",
    ]
    .join("\n")
}

/// autounattend.xml for bare-ISO Windows installs (no cloudbase template).
pub fn autounattend_xml(spec: &VmSpec, admin_password: &str, static_ip: Option<&StaticIpConfig>) -> String {
    let network_component = match static_ip {
        Some(ip) => {
            let (address, prefix) = ip
                .address
                .split_once('/')
                .unwrap_or((ip.address.as_str(), "24"));
            format!(
                r#"    <component name="Microsoft-Windows-TCPIP" processorArchitecture="amd64" publicKeyToken="31bf3856ad364e35">
      <Interfaces>
        <Interface wcm:action="add">
          <Identifier>Ethernet</Identifier>
          <Ipv4Settings><DhcpEnabled>false</DhcpEnabled></Ipv4Settings>
          <UnicastIpAddresses>
            <IpAddress wcm:action="add" wcm:keyValue="1">{address}/{prefix}</IpAddress>
          </UnicastIpAddresses>
          <Routes>
            <Route wcm:action="add"><Identifier>0</Identifier><Prefix>0.0.0.0/0</Prefix><NextHopAddress>{gateway}</NextHopAddress></Route>
          </Routes>
        </Interface>
      </Interfaces>
    </component>
"#,
                gateway = ip.gateway
            )
        }
        None => String::new(),
    };
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<unattend xmlns="urn:schemas-microsoft-com:unattend" xmlns:wcm="http://schemas.microsoft.com/WMIConfig/2002/State">
  <settings pass="specialize">
    <component name="Microsoft-Windows-Shell-Setup" processorArchitecture="amd64" publicKeyToken="31bf3856ad364e35">
      <ComputerName>{name}</ComputerName>
    </component>
{network_component}  </settings>
  <settings pass="oobeSystem">
    <component name="Microsoft-Windows-Shell-Setup" processorArchitecture="amd64" publicKeyToken="31bf3856ad364e35">
      <UserAccounts>
        <AdministratorPassword>
          <Value>{password}</Value>
          <PlainText>true</PlainText>
        </AdministratorPassword>
      </UserAccounts>
      <OOBE>
        <HideEULAPage>true</HideEULAPage>
        <SkipMachineOOBE>true</SkipMachineOOBE>
      </OOBE>
    </component>
  </settings>
</unattend>
"#,
        name = spec.name,
        password = admin_password,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CredentialsBundle, OsFamily};

    fn spec() -> VmSpec {
        VmSpec {
            name: "web".into(),
            os_family: OsFamily::Ubuntu,
            os_version: "22.04".into(),
            cores: 2,
            memory_mib: 2048,
            disk_gib: 20,
            networks: vec!["lan".into()],
            ip_policy: None,
            credentials: CredentialsBundle {
                username: "ubuntu".into(),
                ..Default::default()
            },
            post_config: vec![],
            tags: Default::default(),
            priority: 0,
        }
    }

    fn static_ip() -> StaticIpConfig {
        StaticIpConfig {
            address: "10.101.0.30/24".into(),
            gateway: "10.101.0.1".into(),
            nameservers: vec!["10.101.0.1".into()],
        }
    }

    #[test]
    fn user_data_requires_an_ssh_key() {
        let err = cloud_init_user_data(&spec(), "  ", None, true).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn user_data_carries_key_agent_and_static_ip() {
        let doc = cloud_init_user_data(&spec(), "ssh-ed25519 AAAA lab", Some(&static_ip()), true).unwrap();
        assert!(doc.starts_with("#cloud-config"));
        assert!(doc.contains("ssh-ed25519 AAAA lab"));
        assert!(doc.contains("qemu-guest-agent"));
        assert!(doc.contains("10.101.0.30/24"));
        assert!(doc.contains("gateway4: 10.101.0.1"));
    }

    #[test]
    fn user_data_skips_agent_when_template_has_it() {
        let doc = cloud_init_user_data(&spec(), "ssh-ed25519 AAAA lab", None, false).unwrap();
        assert!(!doc.contains("qemu-guest-agent"));
    }

    #[test]
    fn cloudbase_documents_hold_together() {
        let meta: serde_json::Value = serde_json::from_str(&cloudbase_meta_data(&spec(), "Admin")).unwrap();
        assert_eq!(meta["hostname"], "web");
        let script = cloudbase_user_data(Some(&static_ip()));
        assert!(script.starts_with("#ps1_sysnative"));
        assert!(script.contains("fDenyTSConnections"));
        assert!(script.contains("10.101.0.30"));
        let conf = cloudbase_conf();
        assert!(conf.contains("ConfigDriveService"));
        assert!(conf.contains("CreateUserPlugin"));
    }

    #[test]
    fn autounattend_embeds_password_and_static_route() {
        let xml = autounattend_xml(&spec(), "S3cret!", Some(&static_ip()));
        assert!(xml.contains("<ComputerName>web</ComputerName>"));
        assert!(xml.contains("S3cret!"));
        assert!(xml.contains("10.101.0.30"));
        assert!(xml.contains("<NextHopAddress>10.101.0.1</NextHopAddress>"));
    }
}
