use std::{future::Future, time::Duration};

use tokio::{spawn, time::sleep};
use tokio_util::sync::CancellationToken;

/// A scheduled callback that never outlives its owner.
///
/// The callback runs after `delay` unless the owner's token is cancelled or the handle is dropped
/// first. Replacing a stored `Timer` therefore cancels the previous schedule. Once the callback
/// has started it runs to completion, so a callback may safely replace its own handle.
#[derive(Debug)]
pub(crate) struct Timer(CancellationToken);

impl Timer {
	pub fn schedule<F>(delay: Duration, owner: &CancellationToken, callback: F) -> Self
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let token = owner.child_token();

		spawn({
			let token = token.clone();

			async move {
				tokio::select! {
					biased;

					() = token.cancelled() => {}
					() = sleep(delay) => callback.await,
				}
			}
		});

		Self(token)
	}
}

impl Drop for Timer {
	fn drop(&mut self) {
		self.0.cancel();
	}
}
