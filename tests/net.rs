// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
mod shared;

use shared::*;
use std::time::Duration;

/// Tests that two nodes on localhost find each other over real sockets, and that a
/// graceful departure is noticed.
#[tokio::test]
async fn localhost_pair() {
    init_logger();
    let localhost = "127.0.0.1:0".parse().unwrap();

    let a = fast_mesh("a").bind_addr(localhost).create().await.unwrap();
    assert!(a.local_addr().ip().is_loopback());
    assert_ne!(0, a.local_addr().port());

    let b = (fast_mesh("b").bind_addr(localhost))
        .seed(a.local_addr())
        .create()
        .await
        .unwrap();

    assert!(converged(&[&a, &b], 2).await);
    assert_eq!(vec!["a", "b"], names(&a).await);

    b.leave(Duration::from_secs(5)).await.unwrap();
    b.shutdown().await;

    assert!(converged(&[&a], 1).await);
}
