// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shell-style globs over device identifiers.

use regex::{Regex, RegexBuilder};

use crate::device::{DeviceRecord, normalize_mac};
use crate::error::{Error, Result};

/// Returns whether `pattern` contains glob metacharacters.
#[must_use]
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// A compiled glob. `*` matches any run, `?` one character and `[...]` a
/// character class; matching ignores case.
#[derive(Debug, Clone)]
pub struct Glob {
    regex: Regex,
    match_all: bool,
}

impl Glob {
    /// Compiles a glob.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] for an unterminated character class.
    pub fn new(pattern: &str) -> Result<Self> {
        let mut source = String::with_capacity(pattern.len() + 8);
        source.push('^');
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                '[' => {
                    source.push('[');
                    let mut closed = false;
                    let mut first = true;
                    for c in chars.by_ref() {
                        match c {
                            ']' if !first => {
                                closed = true;
                                break;
                            }
                            '!' if first => source.push('^'),
                            '\\' | '[' | '&' | '~' => {
                                source.push('\\');
                                source.push(c);
                            }
                            c => source.push(c),
                        }
                        first = false;
                    }
                    if !closed {
                        return Err(Error::BadRequest(format!("unterminated [ in {pattern:?}")));
                    }
                    source.push(']');
                }
                c => source.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
            }
        }
        source.push('$');

        let regex = RegexBuilder::new(&source)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::BadRequest(format!("invalid pattern {pattern:?}: {e}")))?;
        Ok(Self {
            regex,
            match_all: pattern == "*",
        })
    }

    /// Returns whether the glob matches a single string.
    #[must_use]
    pub fn is_match(&self, s: &str) -> bool {
        self.regex.is_match(s)
    }

    /// Returns whether the glob matches any identifier of `record`.
    #[must_use]
    pub fn matches(&self, record: &DeviceRecord) -> bool {
        if self.match_all {
            return true;
        }
        [record.id.as_str(), record.name.as_str(), record.host.as_str(), record.mac.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .any(|s| self.is_match(s))
            || (!record.mac.is_empty() && self.is_match(&normalize_mac(&record.mac)))
    }
}
