use std::collections::BTreeSet;

use celld_common::models::{
    ActivationStatus, AppType, Purpose, SubscriptionIdentity, SubscriptionRoster, TechFlavor,
};
use serde::Deserialize;

use crate::candidate::{AuthType, CandidateSpec, IpProtocol, RadioBearer};
use crate::error::ConfigError;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CelldConfigInput {
    pub version: u32,
    pub slots: Option<usize>,
    pub default_data_slot: Option<usize>,
    pub candidates: Vec<CandidateInput>,
    pub roster: Vec<RosterEntryInput>,
}

/// Either a list of purpose tags or the wildcard `"*"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PurposesInput {
    Wildcard(String),
    List(Vec<String>),
}

impl Default for PurposesInput {
    fn default() -> Self {
        PurposesInput::List(Vec::new())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CandidateInput {
    pub id: Option<String>,
    pub carrier: Option<String>,
    pub apn: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub auth: Option<String>,
    pub purposes: PurposesInput,
    pub protocol: Option<String>,
    pub roaming_protocol: Option<String>,
    pub bearer: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RosterEntryInput {
    pub slot: usize,
    pub app_type: Option<String>,
    pub app_id: Option<String>,
    pub app_label: Option<String>,
    pub iccid: Option<String>,
    pub gsm_app_index: Option<u32>,
    pub cdma_app_index: Option<u32>,
    pub sub_index: Option<u32>,
    pub status: Option<ActivationStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CelldConfig {
    pub version: u32,
    pub slots: usize,
    pub default_data_slot: Option<usize>,
    pub candidates: Vec<CandidateSpec>,
    /// Initial subscription snapshot, when configured.
    pub roster: Option<SubscriptionRoster>,
}

impl Default for CelldConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            slots: 1,
            default_data_slot: None,
            candidates: Vec::new(),
            roster: None,
        }
    }
}

impl CelldConfigInput {
    pub fn resolve(self) -> Result<CelldConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let slots = self.slots.unwrap_or(1);
        if slots == 0 {
            return Err(ConfigError::NoSlots);
        }
        if let Some(slot) = self.default_data_slot {
            if slot >= slots {
                return Err(ConfigError::DefaultSlotOutOfRange { slot, slots });
            }
        }

        let candidates = self
            .candidates
            .into_iter()
            .enumerate()
            .map(|(index, c)| c.resolve(index))
            .collect::<Result<Vec<_>, _>>()?;

        let roster = if self.roster.is_empty() {
            None
        } else {
            let mut roster = SubscriptionRoster::new(slots);
            for entry in self.roster {
                let slot = entry.slot;
                roster = roster.with_slot(slot, entry.resolve())?;
            }
            Some(roster)
        };

        Ok(CelldConfig {
            version,
            slots,
            default_data_slot: self.default_data_slot,
            candidates,
            roster,
        })
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl CandidateInput {
    fn resolve(self, index: usize) -> Result<CandidateSpec, ConfigError> {
        let apn = non_empty(self.apn).ok_or(ConfigError::MissingField {
            index,
            field: "apn",
        })?;
        let carrier = non_empty(self.carrier).ok_or(ConfigError::MissingField {
            index,
            field: "carrier",
        })?;

        let purposes: BTreeSet<Purpose> = match self.purposes {
            PurposesInput::Wildcard(w) if w.trim() == "*" => Purpose::ALL.into_iter().collect(),
            PurposesInput::Wildcard(single) => std::iter::once(single.parse()?).collect(),
            PurposesInput::List(list) => list
                .iter()
                .map(|p| p.parse())
                .collect::<Result<_, _>>()?,
        };
        if purposes.is_empty() {
            return Err(ConfigError::MissingField {
                index,
                field: "purposes",
            });
        }

        let protocol: IpProtocol = self.protocol.as_deref().unwrap_or("").parse()?;
        let roaming_protocol = match self.roaming_protocol.as_deref() {
            Some(p) => p.parse()?,
            None => protocol,
        };

        Ok(CandidateSpec {
            id: non_empty(self.id),
            carrier,
            apn,
            user: self.user.unwrap_or_default(),
            password: self.password.unwrap_or_default(),
            auth: self.auth.as_deref().unwrap_or("").parse::<AuthType>()?,
            purposes,
            protocol,
            roaming_protocol,
            bearer: self
                .bearer
                .as_deref()
                .map(str::parse::<RadioBearer>)
                .transpose()?,
        })
    }
}

impl RosterEntryInput {
    fn resolve(self) -> SubscriptionIdentity {
        let app_type = self
            .app_type
            .as_deref()
            .map(AppType::from)
            .unwrap_or_default();
        // Fill the index for the application's family when not given.
        let (gsm, cdma) = match (self.gsm_app_index, self.cdma_app_index, app_type.flavor()) {
            (None, None, Some(TechFlavor::Gsm)) => (Some(0), None),
            (None, None, Some(TechFlavor::Cdma)) => (None, Some(0)),
            (g, c, _) => (g, c),
        };
        SubscriptionIdentity {
            slot: Some(self.slot),
            gsm_app_index: gsm,
            cdma_app_index: cdma,
            sub_index: self.sub_index,
            status: self.status.unwrap_or(ActivationStatus::Activated),
            app_id: non_empty(self.app_id),
            app_label: non_empty(self.app_label),
            app_type,
            iccid: non_empty(self.iccid),
        }
    }
}

impl CelldConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(CelldConfig::default());
        }
        let parsed: CelldConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    /// Candidate specs only, for a catalog reload.
    pub fn candidates_from_toml_str(input: &str) -> Result<Vec<CandidateSpec>, ConfigError> {
        Ok(Self::from_toml_str(input)?.candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1
            slots = 2
            default_data_slot = 1

            [[candidates]]
            id = "tmo-internet"
            carrier = "310260"
            apn = "fast.t-mobile.com"
            purposes = ["default", "supl"]
            protocol = "ipv4v6"

            [[candidates]]
            carrier = "310260"
            apn = "wap.voicestream.com"
            user = "guest"
            password = "guest"
            auth = "pap"
            purposes = "*"
            roaming_protocol = "ip"
            bearer = "lte"

            [[roster]]
            slot = 1
            app_type = "CSIM"
            iccid = "89011200000000000001"
        "#;

        let cfg = CelldConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.slots, 2);
        assert_eq!(cfg.default_data_slot, Some(1));
        assert_eq!(cfg.candidates.len(), 2);

        let first = &cfg.candidates[0];
        assert_eq!(first.id.as_deref(), Some("tmo-internet"));
        assert!(first.purposes.contains(&Purpose::Internet));
        assert!(first.purposes.contains(&Purpose::Supl));
        assert_eq!(first.protocol, IpProtocol::Ipv4v6);
        assert_eq!(first.roaming_protocol, IpProtocol::Ipv4v6);

        let second = &cfg.candidates[1];
        assert!(second.id.is_none());
        assert_eq!(second.purposes.len(), Purpose::ALL.len());
        assert_eq!(second.auth, AuthType::Pap);
        assert_eq!(second.bearer, Some(RadioBearer::Lte));

        let roster = cfg.roster.unwrap();
        assert_eq!(roster.len(), 2);
        let slot1 = roster.get(1).unwrap();
        assert_eq!(slot1.app_type, AppType::Csim);
        assert_eq!(slot1.cdma_app_index, Some(0));
        assert_eq!(slot1.gsm_app_index, None);
        assert!(roster.get(0).unwrap().is_cleared());
    }

    #[test]
    fn empty_input_is_default() {
        assert_eq!(CelldConfig::from_toml_str("  ").unwrap(), CelldConfig::default());
    }

    #[test]
    fn unknown_purpose_rejected() {
        let toml = r#"
            [[candidates]]
            carrier = "310260"
            apn = "x"
            purposes = ["internet", "wap"]
        "#;
        let err = CelldConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPurpose(_)));
    }

    #[test]
    fn missing_apn_rejected() {
        let toml = r#"
            [[candidates]]
            carrier = "310260"
            purposes = ["internet"]
        "#;
        assert!(matches!(
            CelldConfig::from_toml_str(toml).unwrap_err(),
            ConfigError::MissingField { index: 0, field: "apn" }
        ));
    }

    #[test]
    fn bad_version_and_slots_rejected() {
        assert!(matches!(
            CelldConfig::from_toml_str("version = 2").unwrap_err(),
            ConfigError::UnsupportedVersion(2)
        ));
        assert!(matches!(
            CelldConfig::from_toml_str("slots = 0").unwrap_err(),
            ConfigError::NoSlots
        ));
        assert!(matches!(
            CelldConfig::from_toml_str("slots = 1\ndefault_data_slot = 1").unwrap_err(),
            ConfigError::DefaultSlotOutOfRange { slot: 1, slots: 1 }
        ));
    }

    #[test]
    fn roster_slot_out_of_range_rejected() {
        let toml = r#"
            slots = 1
            [[roster]]
            slot = 3
            app_type = "USIM"
        "#;
        assert!(matches!(
            CelldConfig::from_toml_str(toml).unwrap_err(),
            ConfigError::Roster(_)
        ));
    }
}
