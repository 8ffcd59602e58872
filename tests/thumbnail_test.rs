//! Thumbnail integration tests.

mod common;

use common::{create_test_jpeg, create_test_png, TestServer, SERVER_NAME};
use image::GenericImageView;
use matrix_media_store::config::{ThumbnailFallback, ThumbnailSizeConfig};
use matrix_media_store::models::{MediaId, ResizeMethod, ThumbnailSize};
use matrix_media_store::services::GenerateOutcome;
use std::time::Duration;

fn thumbnail_path(media_id: &str, width: u32, height: u32, method: &str) -> String {
    format!(
        "/thumbnail/{}/{}?width={}&height={}&method={}",
        SERVER_NAME, media_id, width, height, method
    )
}

async fn fetch(server: &TestServer, path: &str) -> reqwest::Response {
    server
        .client()
        .get(server.media(path))
        .send()
        .await
        .expect("Failed to fetch")
}

#[tokio::test]
async fn test_dynamic_crop_is_exact() {
    let server = TestServer::start_with(|c| c.media.dynamic_thumbnails = true).await;
    let media_id = server
        .upload_ok("wide.png", "image/png", create_test_png(800, 400))
        .await;

    let response = fetch(&server, &thumbnail_path(&media_id, 200, 200, "crop")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "image/jpeg");

    let body = response.bytes().await.unwrap();
    let img = image::load_from_memory(&body).unwrap();
    assert_eq!(img.dimensions(), (200, 200));
}

#[tokio::test]
async fn test_dynamic_scale_preserves_aspect() {
    let server = TestServer::start_with(|c| c.media.dynamic_thumbnails = true).await;
    let media_id = server
        .upload_ok("wide.png", "image/png", create_test_png(800, 400))
        .await;

    let body = fetch(&server, &thumbnail_path(&media_id, 200, 200, "scale"))
        .await
        .bytes()
        .await
        .unwrap();

    let img = image::load_from_memory(&body).unwrap();
    assert_eq!(img.dimensions(), (200, 100));
}

#[tokio::test]
async fn test_method_defaults_to_scale() {
    let server = TestServer::start_with(|c| c.media.dynamic_thumbnails = true).await;
    let media_id = server
        .upload_ok("wide.jpg", "image/jpeg", create_test_jpeg(800, 400, 90))
        .await;

    let path = format!(
        "/thumbnail/{}/{}?width=100&height=100",
        SERVER_NAME, media_id
    );
    let body = fetch(&server, &path).await.bytes().await.unwrap();

    let img = image::load_from_memory(&body).unwrap();
    assert_eq!(img.dimensions(), (100, 50));
}

#[tokio::test]
async fn test_no_upscale_serves_original() {
    let server = TestServer::start_with(|c| c.media.dynamic_thumbnails = true).await;
    let png = create_test_png(800, 400);
    let media_id = server.upload_ok("wide.png", "image/png", png.clone()).await;

    let response = fetch(&server, &thumbnail_path(&media_id, 1000, 1000, "scale")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "image/png");
    assert_eq!(response.bytes().await.unwrap().as_ref(), png.as_slice());

    let parent = MediaId::parse(&media_id).unwrap();
    assert!(server.state.db.get_thumbnails(&parent).unwrap().is_empty());
}

#[tokio::test]
async fn test_generation_is_idempotent() {
    let server = TestServer::start().await;
    let media_id = server
        .upload_ok("wide.png", "image/png", create_test_png(800, 400))
        .await;

    let parent = MediaId::parse(&media_id).unwrap();
    let source = server.state.db.get_media_metadata(&parent).unwrap().unwrap();
    let size = ThumbnailSize::new(64, 64, ResizeMethod::Crop);

    let first = server.state.thumbnailer.generate(&source, size).await.unwrap();
    let second = server.state.thumbnailer.generate(&source, size).await.unwrap();

    assert!(matches!(first, GenerateOutcome::Generated(_)));
    assert!(matches!(second, GenerateOutcome::AlreadyExists(_)));
    assert_eq!(server.state.db.get_thumbnails(&parent).unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_generation_stores_once() {
    let server = TestServer::start().await;
    let media_id = server
        .upload_ok("wide.png", "image/png", create_test_png(800, 400))
        .await;

    let parent = MediaId::parse(&media_id).unwrap();
    let source = server.state.db.get_media_metadata(&parent).unwrap().unwrap();
    let size = ThumbnailSize::new(96, 96, ResizeMethod::Scale);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let thumbnailer = server.state.thumbnailer.clone();
        let source = source.clone();
        handles.push(tokio::spawn(async move {
            thumbnailer.generate(&source, size).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(server.state.db.get_thumbnails(&parent).unwrap().len(), 1);
}

#[tokio::test]
async fn test_thumbnail_inherits_parent_fields() {
    let server = TestServer::start().await;
    let media_id = server
        .upload_ok("holiday.png", "image/png", create_test_png(400, 400))
        .await;

    let parent = MediaId::parse(&media_id).unwrap();
    let source = server.state.db.get_media_metadata(&parent).unwrap().unwrap();
    let size = ThumbnailSize::new(32, 32, ResizeMethod::Crop);

    let outcome = server.state.thumbnailer.generate(&source, size).await.unwrap();
    let thumb = outcome.metadata().unwrap();

    assert_eq!(thumb.parent_id.as_ref(), Some(&parent));
    assert_eq!(thumb.owner_id, source.owner_id);
    assert_eq!(thumb.upload_name, "holiday.png");
    assert_eq!(thumb.content_type, "image/jpeg");
    assert_eq!(thumb.thumbnail_size, Some(size));
}

#[tokio::test]
async fn test_fallback_not_found() {
    let server = TestServer::start_with(|c| {
        c.media.dynamic_thumbnails = false;
        c.media.thumbnail_fallback = ThumbnailFallback::NotFound;
    })
    .await;
    let media_id = server
        .upload_ok("wide.png", "image/png", create_test_png(800, 400))
        .await;

    let response = fetch(&server, &thumbnail_path(&media_id, 64, 64, "crop")).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_fallback_nearest_uses_stored_size() {
    let server = TestServer::start().await;
    let media_id = server
        .upload_ok("wide.png", "image/png", create_test_png(800, 400))
        .await;

    let parent = MediaId::parse(&media_id).unwrap();
    let source = server.state.db.get_media_metadata(&parent).unwrap().unwrap();
    server
        .state
        .thumbnailer
        .generate(&source, ThumbnailSize::new(320, 240, ResizeMethod::Crop))
        .await
        .unwrap();

    let response = fetch(&server, &thumbnail_path(&media_id, 100, 100, "crop")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "image/jpeg");

    let img = image::load_from_memory(&response.bytes().await.unwrap()).unwrap();
    assert_eq!(img.dimensions(), (320, 240));
}

#[tokio::test]
async fn test_fallback_nearest_without_thumbnails_serves_original() {
    let server = TestServer::start().await;
    let media_id = server
        .upload_ok("wide.png", "image/png", create_test_png(800, 400))
        .await;

    let response = fetch(&server, &thumbnail_path(&media_id, 100, 100, "crop")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "image/png");
}

#[tokio::test]
async fn test_non_image_serves_original() {
    let server = TestServer::start_with(|c| c.media.dynamic_thumbnails = true).await;
    let media_id = server
        .upload_ok("notes.txt", "text/plain", b"not a picture".to_vec())
        .await;

    let response = fetch(&server, &thumbnail_path(&media_id, 32, 32, "crop")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"not a picture");
}

#[tokio::test]
async fn test_invalid_thumbnail_parameters() {
    let server = TestServer::start().await;
    let media_id = server
        .upload_ok("wide.png", "image/png", create_test_png(80, 40))
        .await;

    for path in [
        thumbnail_path(&media_id, 0, 32, "crop"),
        thumbnail_path(&media_id, 32, 5000, "crop"),
        thumbnail_path(&media_id, 32, 32, "stretch"),
        format!("/thumbnail/{}/{}?width=32", SERVER_NAME, media_id),
    ] {
        let response = fetch(&server, &path).await;
        assert_eq!(response.status(), 400, "{} should be rejected", path);
    }
}

#[tokio::test]
async fn test_queue_pregenerates_configured_sizes() {
    let server = TestServer::start_with(|c| {
        c.media.thumbnail_sizes = vec![
            ThumbnailSizeConfig {
                width: 32,
                height: 32,
                method: ResizeMethod::Crop,
            },
            ThumbnailSizeConfig {
                width: 96,
                height: 96,
                method: ResizeMethod::Scale,
            },
        ];
    })
    .await;

    let media_id = server
        .upload_ok("wide.png", "image/png", create_test_png(400, 200))
        .await;
    let parent = MediaId::parse(&media_id).unwrap();

    let mut stored = 0;
    for _ in 0..100 {
        stored = server.state.db.get_thumbnails(&parent).unwrap().len();
        if stored == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(stored, 2);

    let exact = server
        .state
        .db
        .get_thumbnail(&parent, &ThumbnailSize::new(32, 32, ResizeMethod::Crop))
        .unwrap();
    assert!(exact.is_some());
}

#[tokio::test]
async fn test_undecodable_image_types_serve_original() {
    let server = TestServer::start_with(|c| c.media.dynamic_thumbnails = true).await;
    let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="800" height="400"/>"#.to_vec();
    let bmp = b"BM not really a bitmap".to_vec();

    for (name, content_type, data) in [("logo.svg", "image/svg+xml", svg), ("old.bmp", "image/bmp", bmp)] {
        let media_id = server.upload_ok(name, content_type, data.clone()).await;

        let response = fetch(&server, &thumbnail_path(&media_id, 32, 32, "crop")).await;
        assert_eq!(response.status(), 200, "{} thumbnail failed", content_type);
        assert_eq!(response.headers()["content-type"], content_type);
        assert_eq!(response.bytes().await.unwrap().as_ref(), data.as_slice());

        let parent = MediaId::parse(&media_id).unwrap();
        assert!(server.state.db.get_thumbnails(&parent).unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_corrupt_image_serves_original() {
    let server = TestServer::start_with(|c| c.media.dynamic_thumbnails = true).await;
    let media_id = server
        .upload_ok("broken.png", "image/png", b"definitely not a png".to_vec())
        .await;

    let response = fetch(&server, &thumbnail_path(&media_id, 32, 32, "scale")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"definitely not a png");
}
