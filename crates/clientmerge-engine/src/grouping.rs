use std::collections::BTreeMap;

use clientmerge_core::{ClientWithCounts, DuplicateGroup};

/// Grouping key: lowercased, with leading and trailing whitespace removed.
/// Inner whitespace and punctuation are kept, so matching stays exact.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Partition clients by normalized name, keeping only names shared by two or
/// more clients. Groups are ordered by key and members by id.
///
/// Clients with a blank name are never grouped.
pub fn group_duplicates(clients: &[ClientWithCounts]) -> Vec<DuplicateGroup> {
    let mut by_key: BTreeMap<String, Vec<ClientWithCounts>> = BTreeMap::new();
    for entry in clients {
        let key = normalize_name(&entry.client.name);
        if key.is_empty() {
            continue;
        }
        by_key.entry(key).or_default().push(entry.clone());
    }

    by_key
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(key, mut members)| {
            members.sort_by_key(|m| m.client.id);
            DuplicateGroup { key, members }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clientmerge_core::{Client, ReferenceCounts};

    fn entry(id: i64, name: &str) -> ClientWithCounts {
        ClientWithCounts {
            client: Client::new(id, name),
            counts: ReferenceCounts::default(),
        }
    }

    #[test]
    fn case_and_outer_whitespace_do_not_split_groups() {
        let clients = vec![
            entry(3, "JOHN SMITH"),
            entry(1, "John Smith"),
            entry(2, " john smith "),
        ];
        let groups = group_duplicates(&clients);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "john smith");
        let ids: Vec<_> = groups[0].members.iter().map(|m| m.client.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn singletons_and_near_matches_are_dropped() {
        let clients = vec![
            entry(1, "John Smith"),
            entry(2, "Jon Smith"),
            entry(3, "John  Smith"),
            entry(4, "Mary Jones"),
        ];
        assert!(group_duplicates(&clients).is_empty());
    }

    #[test]
    fn groups_are_ordered_by_key() {
        let clients = vec![
            entry(1, "Zed Corp"),
            entry(2, "acme"),
            entry(3, "zed corp"),
            entry(4, "ACME"),
        ];
        let keys: Vec<_> = group_duplicates(&clients)
            .into_iter()
            .map(|g| g.key)
            .collect();
        assert_eq!(keys, vec!["acme", "zed corp"]);
    }

    #[test]
    fn blank_names_are_not_duplicates_of_each_other() {
        let clients = vec![entry(1, ""), entry(2, "   "), entry(3, "\t")];
        assert!(group_duplicates(&clients).is_empty());
    }

    #[test]
    fn non_ascii_names_fold_case() {
        assert_eq!(normalize_name("  ÉMILE Zola "), "émile zola");
    }
}
