// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Internal utility proc-macros for the safe deposit box crates.
//!
//! Note: This is separate from the `sdb_ore` crate because `proc-macro` crates are only allowed
//! to export procedural macros and nothing else.

use proc_macro::TokenStream;


/// Wrapper around the `test` macro.
///
/// The wrapper automatically initializes our logging infrastructure. With no
/// arguments it expands to the standard `#[test]`; otherwise the argument is
/// used as the test attribute, e.g. `#[sdb_ore::test(tokio::test)]`.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    test::test_impl(attr, item)
}
