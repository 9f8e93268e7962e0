use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

pub const DEFAULT_HOST_ALIAS: &str = "digital_twin";

/// Single-host inventory pointing the apply tool at the twin guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inventory {
    pub host_alias: String,
    pub address: String,
    pub user: String,
    pub ssh_key: PathBuf,
}

#[derive(Serialize)]
struct InventoryFile<'a> {
    all: Group<'a>,
}

#[derive(Serialize)]
struct Group<'a> {
    hosts: BTreeMap<&'a str, HostVars<'a>>,
    vars: GroupVars,
}

#[derive(Serialize)]
struct HostVars<'a> {
    ansible_host: &'a str,
    ansible_user: &'a str,
}

#[derive(Serialize)]
struct GroupVars {
    ansible_ssh_private_key_file: String,
}

impl Inventory {
    pub fn new(address: impl Into<String>, user: impl Into<String>, ssh_key: impl Into<PathBuf>) -> Self {
        Self {
            host_alias: DEFAULT_HOST_ALIAS.to_string(),
            address: address.into(),
            user: user.into(),
            ssh_key: ssh_key.into(),
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        let file = InventoryFile {
            all: Group {
                hosts: BTreeMap::from([(
                    self.host_alias.as_str(),
                    HostVars {
                        ansible_host: &self.address,
                        ansible_user: &self.user,
                    },
                )]),
                vars: GroupVars {
                    ansible_ssh_private_key_file: self.ssh_key.display().to_string(),
                },
            },
        };
        serde_yaml::to_string(&file)
    }
}
