//! Variant workflow: regenerate, refine, adopt.

mod common;

use common::{harness, request, Harness};
use std::sync::Arc;
use storybook_core::domain::{Book, Page, PointReason};
use storybook_core::ports::{DatabaseService, PortError};
use uuid::Uuid;

async fn book_with_pages(h: &Harness, points: i64) -> (Uuid, Book, Vec<Page>) {
    let user = h.db.seed_user(points).unwrap();
    let book = h.studio.generate_book(user, request(5), None).await.unwrap();
    let pages = h.db.get_pages_for_book(book.id).await.unwrap();
    (user, book, pages)
}

async fn adopted_count(h: &Harness, page_id: Uuid) -> usize {
    h.db.get_page_images(page_id)
        .await
        .unwrap()
        .iter()
        .filter(|v| v.is_adopted)
        .count()
}

#[tokio::test]
async fn regenerate_then_accept_swaps_the_adopted_variant() {
    let h = harness();
    let (user, _book, pages) = book_with_pages(&h, 200).await;
    let page = &pages[1];
    let image_a = page.image_url.clone().unwrap();

    let variant_b = h
        .studio
        .regenerate_page_image(user, page.id, &image_a)
        .await
        .unwrap();
    assert!(!variant_b.is_adopted);
    assert_eq!(Some(variant_b.prompt.clone()), page.prompt);

    let unchanged = h.db.get_page_context(page.id).await.unwrap().page;
    assert_eq!(unchanged.image_url.as_deref(), Some(image_a.as_str()));

    let adopted = h
        .studio
        .apply_new_image(user, page.id, &variant_b.image_url)
        .await
        .unwrap();
    assert_eq!(adopted.image_url.as_deref(), Some(variant_b.image_url.as_str()));
    assert_eq!(adopted.version, page.version + 1);

    let variants = h.db.get_page_images(page.id).await.unwrap();
    let a = variants.iter().find(|v| v.image_url == image_a).unwrap();
    let b = variants.iter().find(|v| v.image_url == variant_b.image_url).unwrap();
    assert!(!a.is_adopted);
    assert!(b.is_adopted);
}

#[tokio::test]
async fn regenerate_debits_the_fixed_cost_with_page_reference() {
    let h = harness();
    let (user, book, pages) = book_with_pages(&h, 100).await;
    let page = &pages[2];

    h.studio
        .regenerate_page_image(user, page.id, page.image_url.as_deref().unwrap())
        .await
        .unwrap();

    assert_eq!(h.db.get_user(user).await.unwrap().points, 15);
    let latest = &h.db.get_point_history(user).await.unwrap()[0];
    assert_eq!(latest.reason, PointReason::RegeneratePage);
    assert_eq!(latest.delta, -10);
    assert_eq!(latest.book_id, Some(book.id));
    assert_eq!(latest.page_id, Some(page.id));
}

#[tokio::test]
async fn regenerate_from_a_pending_variant_reuses_its_prompt() {
    let h = harness();
    let (user, _book, pages) = book_with_pages(&h, 200).await;
    let page = &pages[3];

    let refined = h
        .studio
        .refine_and_regenerate_page_image(
            user,
            page.id,
            page.image_url.as_deref().unwrap(),
            "add a balloon",
        )
        .await
        .unwrap();
    let again = h
        .studio
        .regenerate_page_image(user, page.id, &refined.image.image_url)
        .await
        .unwrap();
    assert_eq!(again.prompt, refined.image.prompt);
    assert_eq!(h.db.get_page_images(page.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn refine_rewrites_scene_and_appends_style() {
    let h = harness();
    let (user, _book, pages) = book_with_pages(&h, 200).await;
    let page = &pages[1];

    let refined = h
        .studio
        .refine_and_regenerate_page_image(
            user,
            page.id,
            page.image_url.as_deref().unwrap(),
            "make it hold a balloon",
        )
        .await
        .unwrap();

    assert_eq!(
        refined.scene_prompt,
        "The main character holds a red balloon near a river."
    );
    let lines: Vec<&str> = refined.image.prompt.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], refined.scene_prompt);
    assert!(lines[1].contains("watercolor"));
    assert!(!refined.image.is_adopted);

    let revision_request = h.text.requests().pop().unwrap();
    let user_message = &revision_request[1].content;
    assert!(user_message.contains("make it hold a balloon"));
    assert!(user_message.contains("The fox does thing 1."));
    assert!(!user_message.contains("watercolor"));

    let latest = &h.db.get_point_history(user).await.unwrap()[0];
    assert_eq!(latest.reason, PointReason::RefineAndRegenerate);
}

#[tokio::test]
async fn accepting_repeatedly_keeps_exactly_one_adopted() {
    let h = harness();
    let (user, _book, pages) = book_with_pages(&h, 500).await;
    let page = &pages[0];
    let original = page.image_url.clone().unwrap();

    let mut urls = vec![original.clone()];
    for _ in 0..3 {
        let v = h
            .studio
            .regenerate_page_image(user, page.id, &original)
            .await
            .unwrap();
        urls.push(v.image_url);
    }

    for url in urls.iter().chain(urls.iter().rev()) {
        let page_after = h.studio.apply_new_image(user, page.id, url).await.unwrap();
        assert_eq!(adopted_count(&h, page.id).await, 1);
        assert_eq!(page_after.image_url.as_deref(), Some(url.as_str()));
    }
}

#[tokio::test]
async fn concurrent_accepts_leave_a_single_adopted_variant() {
    let h = Arc::new(harness());
    let (user, _book, pages) = book_with_pages(&h, 500).await;
    let page_id = pages[4].id;
    let original = pages[4].image_url.clone().unwrap();
    let mut urls = vec![original.clone()];
    for _ in 0..4 {
        urls.push(
            h.studio
                .regenerate_page_image(user, page_id, &original)
                .await
                .unwrap()
                .image_url,
        );
    }

    let handles: Vec<_> = urls
        .iter()
        .cloned()
        .map(|url| {
            let h = h.clone();
            tokio::spawn(async move { h.studio.apply_new_image(user, page_id, &url).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(adopted_count(&h, page_id).await, 1);
    let page = h.db.get_page_context(page_id).await.unwrap().page;
    let adopted = h
        .db
        .get_page_images(page_id)
        .await
        .unwrap()
        .into_iter()
        .find(|v| v.is_adopted)
        .unwrap();
    assert_eq!(page.image_url, Some(adopted.image_url));
}

#[tokio::test]
async fn accepting_an_unknown_image_is_not_found() {
    let h = harness();
    let (user, _book, pages) = book_with_pages(&h, 100).await;

    let err = h
        .studio
        .apply_new_image(user, pages[1].id, "memory://elsewhere.png")
        .await
        .unwrap_err();
    assert!(matches!(err, PortError::NotFound(_)));
    assert_eq!(adopted_count(&h, pages[1].id).await, 1);
}

#[tokio::test]
async fn image_of_another_page_cannot_be_adopted() {
    let h = harness();
    let (user, _book, pages) = book_with_pages(&h, 100).await;
    let foreign = pages[2].image_url.clone().unwrap();

    let err = h
        .studio
        .apply_new_image(user, pages[1].id, &foreign)
        .await
        .unwrap_err();
    assert!(matches!(err, PortError::NotFound(_)));
}

#[tokio::test]
async fn other_users_page_is_forbidden_not_missing() {
    let h = harness();
    let (_owner, _book, pages) = book_with_pages(&h, 100).await;
    let intruder = h.db.seed_user(100).unwrap();
    let url = pages[1].image_url.clone().unwrap();

    assert!(matches!(
        h.studio.regenerate_page_image(intruder, pages[1].id, &url).await,
        Err(PortError::Forbidden(_))
    ));
    assert!(matches!(
        h.studio.apply_new_image(intruder, pages[1].id, &url).await,
        Err(PortError::Forbidden(_))
    ));
    assert!(matches!(
        h.studio
            .regenerate_page_image(intruder, Uuid::new_v4(), &url)
            .await,
        Err(PortError::NotFound(_))
    ));
    assert_eq!(h.db.get_user(intruder).await.unwrap().points, 100);
}

#[tokio::test]
async fn regeneration_without_credits_renders_nothing() {
    let h = harness();
    let (user, _book, pages) = book_with_pages(&h, 80).await;
    let images_before = h.images.calls();

    let err = h
        .studio
        .regenerate_page_image(user, pages[1].id, pages[1].image_url.as_deref().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PortError::InsufficientCredits { required: 10, current: 5 }
    ));
    assert_eq!(h.images.calls(), images_before);
    assert_eq!(h.db.get_page_images(pages[1].id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn empty_feedback_is_rejected() {
    let h = harness();
    let (user, _book, pages) = book_with_pages(&h, 100).await;
    let err = h
        .studio
        .refine_and_regenerate_page_image(
            user,
            pages[1].id,
            pages[1].image_url.as_deref().unwrap(),
            "   ",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PortError::InvalidInput(_)));
}
