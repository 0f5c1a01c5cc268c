//! Parsing of the controller's instance listing (`axiom-ls`).

use serde::Serialize;

use crate::db::enums::InstanceStatus;

/// One instance as reported by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedInstance {
    pub name: String,
    pub primary_ip: String,
    pub backend_ip: String,
    pub region: String,
    pub size: String,
    pub status: InstanceStatus,
    pub cost: Option<String>,
}

/// Parses the tabular `axiom-ls` output.
///
/// Header rows, separator rows and the trailing summary are skipped; rows
/// with fewer than six columns are ignored.
pub fn parse_instance_list(output: &str) -> Vec<ObservedInstance> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !is_decoration(line))
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 {
                return None;
            }
            Some(ObservedInstance {
                name: parts[0].to_string(),
                primary_ip: parts[1].to_string(),
                backend_ip: parts[2].to_string(),
                region: parts[3].to_string(),
                size: parts[4].to_string(),
                status: InstanceStatus::from_controller(parts[5]),
                cost: parts.get(6).map(|c| c.to_string()),
            })
        })
        .collect()
}

fn is_decoration(line: &str) -> bool {
    line.starts_with("Instance")
        || line.contains("Instances")
        || line.chars().all(|c| matches!(c, '_' | '-' | '=' | ' ' | '|'))
}

/// An instance belongs to a fleet when its name is the fleet's remote prefix
/// followed by a numeric suffix.
pub fn belongs_to_fleet(instance_name: &str, remote_prefix: &str) -> bool {
    instance_name
        .strip_prefix(remote_prefix)
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

pub fn instances_of_fleet<'a>(
    observed: &'a [ObservedInstance],
    remote_prefix: &'a str,
) -> impl Iterator<Item = &'a ObservedInstance> + 'a {
    observed
        .iter()
        .filter(move |i| belongs_to_fleet(&i.name, remote_prefix))
}
