//! Device name parsing.
//!
//! Full names look like `/job:localhost/replica:0/task:0/device:CPU:0`; the
//! local form is `CPU:0`. Requests may be partial (`/device:CPU:1`, `CPU:1`,
//! `/cpu:1`) and are matched case-insensitively on the device type.

use std::fmt;

use crate::error::IrError;

pub const DEFAULT_JOB: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DeviceName {
    pub job: Option<String>,
    pub replica: Option<u32>,
    pub task: Option<u32>,
    pub device_type: Option<String>,
    pub id: Option<u32>,
}

impl DeviceName {
    /// Fully specified local device.
    pub fn local(device_type: &str, id: u32) -> Self {
        DeviceName {
            job: Some(DEFAULT_JOB.to_string()),
            replica: Some(0),
            task: Some(0),
            device_type: Some(device_type.to_uppercase()),
            id: Some(id),
        }
    }

    pub fn parse(name: &str) -> Result<Self, IrError> {
        let bad = || IrError::InvalidDeviceName(name.to_string());
        let mut parsed = DeviceName::default();
        if name.is_empty() {
            return Ok(parsed);
        }
        if !name.starts_with('/') {
            let (ty, id) = split_type_id(name).ok_or_else(bad)?;
            parsed.device_type = Some(ty);
            parsed.id = id;
            return Ok(parsed);
        }
        for part in name[1..].split('/') {
            let (key, value) = part.split_once(':').ok_or_else(bad)?;
            match key {
                "job" => parsed.job = Some(value.to_string()),
                "replica" => parsed.replica = Some(value.parse().map_err(|_| bad())?),
                "task" => parsed.task = Some(value.parse().map_err(|_| bad())?),
                "device" => {
                    let (ty, id) = split_type_id(value).ok_or_else(bad)?;
                    parsed.device_type = Some(ty);
                    parsed.id = id;
                }
                other => {
                    // Legacy `/cpu:0` form.
                    let id = value.parse().map_err(|_| bad())?;
                    parsed.device_type = Some(other.to_uppercase());
                    parsed.id = Some(id);
                }
            }
        }
        Ok(parsed)
    }

    pub fn is_fully_specified(&self) -> bool {
        self.job.is_some()
            && self.replica.is_some()
            && self.task.is_some()
            && self.device_type.is_some()
            && self.id.is_some()
    }

    /// `TYPE:id` suffix.
    pub fn local_name(&self) -> String {
        format!(
            "{}:{}",
            self.device_type.as_deref().unwrap_or("*"),
            self.id.map(|i| i.to_string()).unwrap_or_else(|| "*".into())
        )
    }

    /// True when every field set in `self` agrees with `other`.
    pub fn matches(&self, other: &DeviceName) -> bool {
        fn agree<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            match (a, b) {
                (Some(x), Some(y)) => x == y,
                _ => true,
            }
        }
        agree(&self.job, &other.job)
            && agree(&self.replica, &other.replica)
            && agree(&self.task, &other.task)
            && agree(&self.device_type, &other.device_type)
            && agree(&self.id, &other.id)
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(job) = &self.job {
            write!(f, "/job:{}", job)?;
        }
        if let Some(replica) = self.replica {
            write!(f, "/replica:{}", replica)?;
        }
        if let Some(task) = self.task {
            write!(f, "/task:{}", task)?;
        }
        if self.device_type.is_some() {
            write!(f, "/device:{}", self.local_name())?;
        }
        Ok(())
    }
}

fn split_type_id(s: &str) -> Option<(String, Option<u32>)> {
    match s.split_once(':') {
        Some((ty, "*")) if !ty.is_empty() => Some((ty.to_uppercase(), None)),
        Some((ty, id)) if !ty.is_empty() => Some((ty.to_uppercase(), Some(id.parse().ok()?))),
        None if !s.is_empty() => Some((s.to_uppercase(), None)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_name_roundtrip() {
        let name = DeviceName::local("cpu", 1);
        let text = name.to_string();
        assert_eq!(text, "/job:localhost/replica:0/task:0/device:CPU:1");
        assert_eq!(DeviceName::parse(&text).unwrap(), name);
        assert!(name.is_fully_specified());
    }

    #[test]
    fn test_partial_names_match() {
        let full = DeviceName::local("CPU", 1);
        for req in ["CPU:1", "/device:CPU:1", "/cpu:1", "/job:localhost/device:cpu:1", ""] {
            let parsed = DeviceName::parse(req).unwrap();
            assert!(parsed.matches(&full), "{req} should match");
        }
        assert!(!DeviceName::parse("CPU:0").unwrap().matches(&full));
        assert!(!DeviceName::parse("/device:GPU:1").unwrap().matches(&full));
    }

    #[test]
    fn test_parse_errors() {
        assert!(DeviceName::parse("/job").is_err());
        assert!(DeviceName::parse("/replica:x").is_err());
        assert!(DeviceName::parse("CPU:x").is_err());
    }

    #[test]
    fn test_local_name() {
        assert_eq!(DeviceName::local("cpu", 0).local_name(), "CPU:0");
    }
}
