//-
// Copyright (c) 2016, Jason Lingle
//
// Permission to  use, copy,  modify, and/or distribute  this software  for any
// purpose  with or  without fee  is hereby  granted, provided  that the  above
// copyright notice and this permission notice appear in all copies.
//
// THE SOFTWARE  IS PROVIDED "AS  IS" AND  THE AUTHOR DISCLAIMS  ALL WARRANTIES
// WITH  REGARD   TO  THIS  SOFTWARE   INCLUDING  ALL  IMPLIED   WARRANTIES  OF
// MERCHANTABILITY AND FITNESS. IN NO EVENT  SHALL THE AUTHOR BE LIABLE FOR ANY
// SPECIAL,  DIRECT,   INDIRECT,  OR  CONSEQUENTIAL  DAMAGES   OR  ANY  DAMAGES
// WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN ACTION
// OF  CONTRACT, NEGLIGENCE  OR OTHER  TORTIOUS ACTION,  ARISING OUT  OF OR  IN
// CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.

use chrono::Utc;

/// Identifier of a namespace entry (file, directory, or symlink).
///
/// Id 0 is always the root directory.
pub type InodeId = i64;
/// Identifier of one data block of a file.
pub type BlockId = i64;
/// Numeric identifier a `Lease` row assigns to its holder, referenced by
/// every `LeasePath` of that holder.
pub type HolderId = i32;
/// Identifier of a block-token signing key.
pub type KeyId = i32;
/// Wall-clock instant as milliseconds since the epoch.
pub type Timestamp = i64;

/// The inode id of the root directory.
pub const ROOT_INODE_ID: InodeId = 0;
/// Sentinel for "no such inode", e.g. the parent of the root or the owner of
/// a block whose file has been deleted.
pub const NON_EXISTING_INODE: InodeId = -1;

pub const PATH_SEPARATOR: char = '/';

/// Returns the current wall-clock time as epoch milliseconds.
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Splits an absolute slash-separated path into its components.
///
/// The leading empty component stands for the root directory, so `"/a/b"`
/// becomes `["", "a", "b"]` and `"/"` becomes `[""]`. Repeated and trailing
/// separators are collapsed rather than producing empty components.
pub fn path_components(path: &str) -> Vec<String> {
    let mut components = vec![String::new()];
    components.extend(
        path.split(PATH_SEPARATOR)
            .filter(|c| !c.is_empty())
            .map(|c| c.to_owned()),
    );
    components
}

/// Builds the path string of the first `count` components (the root counts
/// as one component), the inverse of `path_components`.
pub fn prefix_path(components: &[String], count: usize) -> String {
    let count = count.min(components.len());
    if count <= 1 {
        return PATH_SEPARATOR.to_string();
    }

    let mut built = String::new();
    for component in &components[1..count] {
        built.push(PATH_SEPARATOR);
        built.push_str(component);
    }
    built
}

/// Joins a resolved symlink target with the remainder of the original path,
/// producing the path a caller restarts resolution against.
pub fn rewrite_link(target: &str, remainder: &str) -> String {
    if remainder.is_empty() {
        target.to_owned()
    } else if target.ends_with(PATH_SEPARATOR) {
        format!("{}{}", target, remainder)
    } else {
        format!("{}{}{}", target, PATH_SEPARATOR, remainder)
    }
}
