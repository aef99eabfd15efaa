#![doc(html_root_url = "https://docs.rs/twig-dom/0.0.1")]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Server-driven state trees for the DOM.
//!
//! - On the server, a [`StateTree`](`state_tree::StateTree`) tracks changes to typed state nodes,
//!   which a [`ChangeCollector`](`change::ChangeCollector`) packs into [`ChangeBatch`](`change::ChangeBatch`)es.
//! - On the client, a [`TreeUpdater`](`updater::TreeUpdater`) applies those batches to a [`Dom`](`dom::Dom`)
//!   and queues DOM events as [`MethodInvocation`](`change::MethodInvocation`)s for the server.

#[cfg(doctest)]
pub mod readme {
	doc_comment::doctest!("../README.md");
}

pub mod change;
pub mod dom;
pub mod error;
pub mod namespace;
pub mod rc_hash_map;
pub mod state_tree;
pub mod updater;
pub mod value_type;
