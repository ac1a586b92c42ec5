use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nieuwscrawl::{extract, membership::{GrowthMode, MembershipFilter}, robots::Robots, validator};
use url::Url;

fn bench_url_valid(c: &mut Criterion) {
    c.bench_function("validator_url_valid", |b| {
        b.iter(|| {
            black_box(validator::url_valid(
                black_box("https://example.com/news/article.htm"),
                black_box(&[]),
            ))
        })
    });
}

fn bench_membership_contains(c: &mut Criterion) {
    let filter = MembershipFilter::new(100_000, 1e-4, GrowthMode::default());
    for i in 0..50_000 {
        filter.add(&format!("https://example.com/page/{i}")).ok();
    }
    c.bench_function("membership_contains_hit", |b| {
        b.iter(|| black_box(filter.contains(black_box("https://example.com/page/42"))))
    });
}

fn bench_robots_can_fetch(c: &mut Criterion) {
    let body = "User-agent: *\nDisallow: /admin\nDisallow: /private\nAllow: /private/public\nCrawl-delay: 1\n";
    let robots = Robots::parse(body);
    let url = Url::parse("https://example.com/private/public/page").unwrap();
    c.bench_function("robots_can_fetch", |b| {
        b.iter(|| black_box(robots.can_fetch(black_box("nieuwscrawl"), black_box(&url))))
    });
}

fn bench_extract_page(c: &mut Criterion) {
    let base = Url::parse("https://example.com/articles/one").unwrap();
    let html = r#"<!doctype html>
<html>
  <head>
    <title>Example article</title>
    <meta name="description" content="An example article for benchmarking">
    <meta name="robots" content="index,follow">
  </head>
  <body>
    <h1>Intro</h1>
    <p>First paragraph of the article body.</p>
    <h2>Details</h2>
    <p>Second paragraph with more detail.</p>
    <ul><li>One</li><li>Two</li><li>Three</li></ul>
    <a href="/a">A</a>
    <a href="/b" rel="nofollow">B</a>
  </body>
</html>"#;

    c.bench_function("extract_page", |b| {
        b.iter(|| black_box(extract::extract(black_box(&base), black_box(html), black_box(&[]))))
    });
}

criterion_group!(
    benches,
    bench_url_valid,
    bench_membership_contains,
    bench_robots_can_fetch,
    bench_extract_page
);
criterion_main!(benches);
