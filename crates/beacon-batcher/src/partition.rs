use beacon_core::{keys, Dispatch};
use std::collections::HashMap;

/// Group dispatches by visitor id.
///
/// Groups are ordered by first appearance and keep the input order inside.
/// Dispatches without a visitor id form one group of their own.
pub fn group_by_partition_key(dispatches: Vec<Dispatch>) -> Vec<Vec<Dispatch>> {
    let mut groups: Vec<Vec<Dispatch>> = Vec::new();
    let mut index: HashMap<Option<String>, usize> = HashMap::new();

    for dispatch in dispatches {
        let key = dispatch.get_str(keys::VISITOR_ID).map(str::to_string);
        match index.get(&key) {
            Some(&position) => groups[position].push(dispatch),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![dispatch]);
            }
        }
    }

    groups
}
