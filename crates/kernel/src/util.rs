// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use meridian_common::TaskError;
use meridian_store::{StoreError, StoreTransaction};

/// All bound names starting with `prefix`, in lexical order.
pub(crate) fn scan_prefix(tx: &mut dyn StoreTransaction, prefix: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut cursor = prefix.to_string();
    while let Some(next) = tx.next_bound_name(&cursor) {
        if !next.starts_with(prefix) {
            break;
        }
        names.push(next.clone());
        cursor = next;
    }
    names
}

/// Store failures inside a task body are non-retryable; conflicts are handled
/// below this level by the transaction runner.
pub(crate) fn store_fatal(e: StoreError) -> TaskError {
    TaskError::fatal(e.to_string())
}
