use std::collections::HashSet;

/// Splice remote history into the local transcript.
///
/// Remote lines are walked in order against a cursor into the local lines.
/// A remote line equal to an unclaimed local line at or after the cursor
/// claims it, and the unclaimed local lines before it stay where they are. A
/// remote line that only matches an unclaimed local line already passed over
/// claims that one in place, so reordered history is not duplicated. A remote
/// line with no unclaimed match is inserted at the cursor. Local lines past
/// the last claim are kept at the end.
///
/// Each local line is emitted once and keeps its relative order; every remote
/// line either claims a distinct local line or is inserted. Merging the same
/// history again is a no-op.
pub fn merge_history_lines(local: &[String], remote: &[String]) -> Vec<String> {
    let mut merged = Vec::with_capacity(local.len() + remote.len());
    let mut claimed = vec![false; local.len()];
    let mut cursor = 0;
    for line in remote {
        if let Some(offset) = local[cursor..].iter().position(|candidate| candidate == line) {
            let index = cursor + offset;
            merged.extend_from_slice(&local[cursor..index]);
            merged.push(line.clone());
            claimed[index] = true;
            cursor = index + 1;
            continue;
        }
        let passed = (0..cursor).find(|&index| !claimed[index] && local[index] == *line);
        match passed {
            Some(index) => claimed[index] = true,
            None => merged.push(line.clone()),
        }
    }
    merged.extend_from_slice(&local[cursor..]);
    merged
}

/// Remote lines followed by the local lines the remote history lacks.
pub fn legacy_merge_history_lines(local: &[String], remote: &[String]) -> Vec<String> {
    let known: HashSet<&str> = remote.iter().map(String::as_str).collect();
    remote
        .iter()
        .chain(local.iter().filter(|line| !known.contains(line.as_str())))
        .cloned()
        .collect()
}
