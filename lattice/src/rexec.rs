// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fire-and-forget remote execution.
//!
//! A remote-callable function is declared with [`remote_fn!`], which
//! generates a zero-sized descriptor type implementing [`RemoteFn`] and
//! registers the handler variants in the process-global task registry at
//! link time. Because the registry tag is derived from the item path, it is
//! identical on every rank of a homogeneous binary; arbitrary closures are
//! not remotable by construction.

use crate::runtime;
use lcomm::Rank;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A function that can be invoked on any rank.
///
/// Implemented by the descriptor types that [`remote_fn!`] generates; not
/// meant to be implemented by hand.
pub trait RemoteFn: 'static {
    /// The argument tuple, serialized onto the wire.
    type Args: Serialize + DeserializeOwned + Send + 'static;
    /// The result, serialized back for the result-returning launch modes.
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Stable registry tag of the fire-and-forget variant.
    const NAME: &'static str;
    /// Tag of the variant that posts the result back to a promise slot.
    const NAME_CONT: &'static str;
    /// Tag of the variant that boxes the result into a shared remote
    /// pointer.
    const NAME_BOXED: &'static str;

    fn call(args: Self::Args) -> impl Future<Output = Self::Output> + Send;
}

/// Run `F` on rank `dest` and forget about it.
///
/// A local destination becomes a detached fiber; a remote one becomes a task
/// message on the outbound queue.
pub fn rexec<F: RemoteFn>(dest: Rank, args: F::Args) {
    let core = runtime::current();
    if dest == core.rank() {
        core.executor().spawn_detached(async move {
            let _ = F::call(args).await;
        });
        return;
    }
    core.enqueue_task(dest, F::NAME, &args);
}

/// Declare remote-callable functions.
///
/// ```ignore
/// lattice::remote_fn! {
///     /// Adds one, anywhere.
///     pub async fn add_one(x: i32) -> i32 { x + 1 }
/// }
///
/// let out = lattice::rasync::<add_one>(Launch::ASYNC, 1, (41,)).await?;
/// ```
///
/// Each declaration produces an ordinary descriptor type named after the
/// function plus three registry entries: fire-and-forget, result-returning,
/// and proxy-boxing.
#[macro_export]
macro_rules! remote_fn {
    () => {};

    (
        $(#[$meta:meta])*
        $vis:vis async fn $name:ident( $($arg:ident : $argty:ty),* $(,)? ) -> $ret:ty $body:block
        $($rest:tt)*
    ) => {
        $crate::remote_fn!(@single $(#[$meta])* $vis async fn $name($($arg : $argty),*) -> $ret $body);
        $crate::remote_fn!($($rest)*);
    };

    (
        $(#[$meta:meta])*
        $vis:vis async fn $name:ident( $($arg:ident : $argty:ty),* $(,)? ) $body:block
        $($rest:tt)*
    ) => {
        $crate::remote_fn!(@single $(#[$meta])* $vis async fn $name($($arg : $argty),*) -> () $body);
        $crate::remote_fn!($($rest)*);
    };

    (@single
        $(#[$meta:meta])*
        $vis:vis async fn $name:ident( $($arg:ident : $argty:ty),* ) -> $ret:ty $body:block
    ) => {
        $(#[$meta])*
        #[allow(non_camel_case_types)]
        #[derive(Debug, Clone, Copy)]
        $vis struct $name;

        impl $crate::RemoteFn for $name {
            type Args = ( $($argty,)* );
            type Output = $ret;

            const NAME: &'static str = concat!(module_path!(), "::", stringify!($name));
            const NAME_CONT: &'static str =
                concat!(module_path!(), "::", stringify!($name), "#cont");
            const NAME_BOXED: &'static str =
                concat!(module_path!(), "::", stringify!($name), "#boxed");

            fn call(args: Self::Args) -> impl ::core::future::Future<Output = Self::Output> + Send {
                let ( $($arg,)* ) = args;
                async move $body
            }
        }

        const _: () = {
            #[$crate::__linkme::distributed_slice($crate::__wire::TASK_REGISTRY)]
            #[linkme(crate = $crate::__linkme)]
            static FIRE: $crate::__wire::TaskEntry = $crate::__wire::TaskEntry {
                name: <$name as $crate::RemoteFn>::NAME,
                invoke: |payload| {
                    let args: <$name as $crate::RemoteFn>::Args =
                        $crate::__wire::decode_args(payload)?;
                    ::core::result::Result::Ok(::std::boxed::Box::pin(async move {
                        let _ = <$name as $crate::RemoteFn>::call(args).await;
                    }))
                },
            };

            #[$crate::__linkme::distributed_slice($crate::__wire::TASK_REGISTRY)]
            #[linkme(crate = $crate::__linkme)]
            static CONT: $crate::__wire::TaskEntry = $crate::__wire::TaskEntry {
                name: <$name as $crate::RemoteFn>::NAME_CONT,
                invoke: |payload| {
                    let (slot, args): (
                        $crate::Rptr<$crate::rasync::ResultSlot>,
                        <$name as $crate::RemoteFn>::Args,
                    ) = $crate::__wire::decode_args(payload)?;
                    ::core::result::Result::Ok(::std::boxed::Box::pin(
                        $crate::rasync::run_and_reply::<$name>(slot, args),
                    ))
                },
            };

            #[$crate::__linkme::distributed_slice($crate::__wire::TASK_REGISTRY)]
            #[linkme(crate = $crate::__linkme)]
            static BOXED: $crate::__wire::TaskEntry = $crate::__wire::TaskEntry {
                name: <$name as $crate::RemoteFn>::NAME_BOXED,
                invoke: |payload| {
                    let (slot, args): (
                        $crate::Rptr<$crate::rasync::ResultSlot>,
                        <$name as $crate::RemoteFn>::Args,
                    ) = $crate::__wire::decode_args(payload)?;
                    ::core::result::Result::Ok(::std::boxed::Box::pin(
                        $crate::rasync::run_and_reply_boxed::<$name>(slot, args),
                    ))
                },
            };
        };
    };
}
