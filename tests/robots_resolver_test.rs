use siteatlas::robots::RobotsResolver;

#[tokio::test]
async fn fetches_once_and_caches_per_host() {
    let mut server = mockito::Server::new_async().await;
    let robots = server
        .mock("GET", "/robots.txt")
        .with_status(200)
        .with_body("User-agent: *\nDisallow: /private/\nCrawl-delay: 1.5\n")
        .expect(1)
        .create_async()
        .await;

    let resolver = RobotsResolver::new(true, false, "atlasbot/0.1").unwrap();
    let base = server.url();

    let verdict = resolver.allows(&format!("{base}/public")).await;
    assert!(verdict.allowed);
    assert!(!verdict.override_used);

    let verdict = resolver.allows(&format!("{base}/private/x")).await;
    assert!(!verdict.allowed);
    assert_eq!(verdict.matched_rule.as_deref(), Some("Disallow: /private/"));

    assert_eq!(
        resolver.crawl_delay(&format!("{base}/anything")).await,
        Some(1.5)
    );

    robots.assert_async().await;
}

#[tokio::test]
async fn server_errors_mean_allow_all() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/robots.txt")
        .with_status(500)
        .create_async()
        .await;

    let resolver = RobotsResolver::new(true, false, "atlasbot/0.1").unwrap();
    let verdict = resolver.allows(&format!("{}/anywhere", server.url())).await;
    assert!(verdict.allowed);
    assert!(verdict.matched_rule.is_none());
    // An HTTP error status is not a transport failure.
    assert!(resolver.take_fetch_failure(&server.url()).is_none());
}

#[tokio::test]
async fn overrides_allow_but_are_counted() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/robots.txt")
        .with_status(200)
        .with_body("User-agent: *\nDisallow: /\n")
        .create_async()
        .await;

    let resolver = RobotsResolver::new(true, true, "atlasbot/0.1").unwrap();
    let verdict = resolver.allows(&format!("{}/page", server.url())).await;
    assert!(verdict.allowed);
    assert!(verdict.override_used);
    // The rule is still parsed and reported.
    assert_eq!(verdict.matched_rule.as_deref(), Some("Disallow: /"));
    assert_eq!(resolver.overrides_used(), 1);
}

#[tokio::test]
async fn transport_failures_surface_once() {
    // Nothing listens on the discard port.
    let resolver = RobotsResolver::new(true, false, "atlasbot/0.1").unwrap();
    let url = "http://127.0.0.1:9/page";
    let verdict = resolver.allows(url).await;
    assert!(verdict.allowed);
    assert!(resolver.take_fetch_failure(url).is_some());
    assert!(resolver.take_fetch_failure(url).is_none());
}
