use proptest::prelude::*;
use siteatlas::urlnorm::{
    NormalizeOptions, ParamPolicy, ParamSampler, TrailingSlash, apply_param_policy,
    is_homograph_attack, is_private_ip, normalize, same_origin, section_of, url_key,
};

#[test]
fn canonical_form_is_stable() {
    let opts = NormalizeOptions::default();
    let input = "HTTP://WWW.Example.COM:80/Blog/Post?b=2&a=1&a=0#section";
    let once = normalize(input, &opts);
    assert_eq!(once, "http://www.example.com/Blog/Post?a=0&a=1&b=2");
    assert_eq!(normalize(&once, &opts), once);
}

#[test]
fn unparseable_input_is_returned_lowercased() {
    let opts = NormalizeOptions::default();
    assert_eq!(normalize("NOT A URL", &opts), "not a url");
    // Idempotent even on the fallback path.
    assert_eq!(normalize("not a url", &opts), "not a url");
}

#[test]
fn url_key_composes_policy_and_normalization() {
    let sampler = ParamSampler::new();
    let opts = NormalizeOptions::default();
    let blocked = vec!["utm_*".to_string()];
    let key = url_key(
        "https://Example.com/page?utm_campaign=x&z=1&a=2#top",
        &opts,
        ParamPolicy::Keep,
        &blocked,
        &sampler,
    );
    assert_eq!(key, "https://example.com/page?a=2&z=1");
    // The key of a key is itself.
    assert_eq!(
        url_key(&key, &opts, ParamPolicy::Keep, &blocked, &sampler),
        key
    );
}

#[test]
fn sample_policy_is_idempotent_across_repeats() {
    let sampler = ParamSampler::new();
    let first = apply_param_policy(
        "https://e.com/?session=aaa",
        ParamPolicy::Sample,
        &[],
        &sampler,
    );
    let again = apply_param_policy(&first, ParamPolicy::Sample, &[], &sampler);
    assert_eq!(first, again);
}

#[test]
fn trailing_slash_modes() {
    let always = NormalizeOptions { trailing_slash: TrailingSlash::Always, ..Default::default() };
    let never = NormalizeOptions { trailing_slash: TrailingSlash::Never, ..Default::default() };
    assert_eq!(normalize("https://e.com/docs", &always), "https://e.com/docs/");
    assert_eq!(normalize("https://e.com/docs/", &never), "https://e.com/docs");
    assert_eq!(normalize("https://e.com/", &never), "https://e.com/");
}

#[test]
fn origin_and_section_classification() {
    assert!(same_origin("https://e.com/a", "https://e.com:443/b"));
    assert!(!same_origin("https://e.com/", "https://www.e.com/"));
    assert_eq!(section_of("https://e.com/blog/2024/post"), "/blog/");
    assert_eq!(section_of("https://e.com"), "/");
}

#[test]
fn safety_predicates() {
    assert!(is_private_ip("http://10.0.0.5/admin"));
    assert!(is_private_ip("http://[fd12:3456::1]/"));
    assert!(!is_private_ip("https://example.com/"));
    assert!(is_homograph_attack("https://g\u{043e}\u{043e}gle.com/"));
    assert!(!is_homograph_attack("https://google.com/"));
}

proptest! {
    /// normalize(normalize(u)) == normalize(u) over arbitrary inputs.
    #[test]
    fn normalization_is_idempotent(input in "\\PC{0,80}") {
        let opts = NormalizeOptions::default();
        let once = normalize(&input, &opts);
        prop_assert_eq!(normalize(&once, &opts), once);
    }

    /// Same over well-formed http(s) URLs with messy paths and queries.
    #[test]
    fn normalization_is_idempotent_for_urls(
        host in "[a-z]{1,10}\\.(com|org|test)",
        path in "(/[a-zA-Z0-9._-]{0,8}){0,4}",
        query in "([a-z]{1,5}=[a-zA-Z0-9]{0,5}&?){0,4}",
    ) {
        let opts = NormalizeOptions::default();
        let input = format!("https://{host}{path}?{query}");
        let once = normalize(&input, &opts);
        prop_assert_eq!(normalize(&once, &opts), once.clone());
        // The canonical form parses.
        prop_assert!(url::Url::parse(&once).is_ok());
    }
}
