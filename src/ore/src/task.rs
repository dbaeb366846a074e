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

//! Tokio task utilities.
//!
//! Every task spawned through this module carries a name, which shows up in
//! the `task` field of its span so stray tasks can be told apart in logs.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument;

/// Spawns a new asynchronous task with a name.
///
/// The name is computed lazily, so building it is free when no subscriber
/// is interested.
#[track_caller]
pub fn spawn<Fut, Name, NameClosure>(nc: NameClosure, future: Fut) -> JoinHandle<Fut::Output>
where
    Name: AsRef<str>,
    NameClosure: FnOnce() -> Name,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let name = nc();
    let span = tracing::debug_span!("task", task = name.as_ref());
    tokio::spawn(future.instrument(span))
}

/// Spawns blocking code on a thread dedicated to blocking operations, with a
/// name.
#[track_caller]
pub fn spawn_blocking<Function, Output, Name, NameClosure>(
    nc: NameClosure,
    function: Function,
) -> JoinHandle<Output>
where
    Name: AsRef<str>,
    NameClosure: FnOnce() -> Name,
    Function: FnOnce() -> Output + Send + 'static,
    Output: Send + 'static,
{
    let span = tracing::debug_span!("task", task = nc().as_ref());
    tokio::task::spawn_blocking(move || span.in_scope(function))
}

/// Extension methods for [`JoinHandle`].
pub trait JoinHandleExt<T> {
    /// Converts the handle into one that aborts its task when dropped.
    fn abort_on_drop(self) -> AbortOnDropHandle<T>;
}

impl<T> JoinHandleExt<T> for JoinHandle<T> {
    fn abort_on_drop(self) -> AbortOnDropHandle<T> {
        AbortOnDropHandle(self)
    }
}

/// A [`JoinHandle`] that aborts its task when dropped.
///
/// Awaiting the handle yields the task's output. Panics inside the task are
/// resumed in the awaiting task.
#[derive(Debug)]
pub struct AbortOnDropHandle<T>(JoinHandle<T>);

impl<T> AbortOnDropHandle<T> {
    /// Aborts the task without waiting for it.
    pub fn abort(&self) {
        self.0.abort();
    }

    /// Reports whether the task has finished.
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    /// Waits for the task to finish, returning the [`JoinError`] rather than
    /// resuming a panic.
    pub async fn join(mut self) -> Result<T, JoinError> {
        (&mut self.0).await
    }
}

impl<T> Drop for AbortOnDropHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Future for AbortOnDropHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        self.0.poll_unpin(cx).map(|res| match res {
            Ok(t) => t,
            Err(e) => match e.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                // Cancelled tasks only come from our own `abort`, after
                // which the handle is not polled again.
                Err(e) => panic!("task failed: {e}"),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[crate::test(tokio::test)]
    async fn spawn_and_await() {
        let handle = spawn(|| "adder", async { 1 + 1 }).abort_on_drop();
        assert_eq!(handle.await, 2);
        let blocking = spawn_blocking(|| "blocking-adder", || 2 + 2).abort_on_drop();
        assert_eq!(blocking.join().await.expect("task succeeds"), 4);
    }

    #[crate::test(tokio::test(start_paused = true))]
    async fn drop_aborts() {
        let ran = Arc::new(AtomicBool::new(false));
        let handle = spawn(|| "sleeper", {
            let ran = Arc::clone(&ran);
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                ran.store(true, Ordering::SeqCst);
            }
        })
        .abort_on_drop();
        drop(handle);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }
}
