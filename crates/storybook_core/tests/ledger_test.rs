//! Credit ledger: history consistency and the one-time public reward.

mod common;

use common::{harness, request};
use storybook_core::domain::{BookStatus, PointReason};
use storybook_core::ports::{DatabaseService, PortError};

#[tokio::test]
async fn history_sums_to_the_balance() {
    let h = harness();
    let user = h.db.seed_user(300).unwrap();
    let book = h.studio.generate_book(user, request(6), None).await.unwrap();
    let pages = h.db.get_pages_for_book(book.id).await.unwrap();
    h.studio
        .regenerate_page_image(user, pages[2].id, pages[2].image_url.as_deref().unwrap())
        .await
        .unwrap();
    h.studio
        .set_visibility(user, book.id, BookStatus::Public)
        .await
        .unwrap();

    let (account, history) = h.studio.point_statement(user).await.unwrap();
    assert_eq!(account.points, 300 - 90 - 10 + 30);
    assert_eq!(history.iter().map(|entry| entry.delta).sum::<i64>(), account.points);

    let reasons: Vec<PointReason> = history.iter().map(|entry| entry.reason).collect();
    assert_eq!(
        reasons,
        vec![
            PointReason::PublicBookReward,
            PointReason::RegeneratePage,
            PointReason::InitialGeneration,
            PointReason::Signup,
        ]
    );
}

#[tokio::test]
async fn public_reward_is_paid_once_across_toggles() {
    let h = harness();
    let user = h.db.seed_user(100).unwrap();
    let book = h.studio.generate_book(user, request(5), None).await.unwrap();

    let first = h
        .studio
        .set_visibility(user, book.id, BookStatus::Public)
        .await
        .unwrap();
    assert!(first.rewarded);
    assert!(first.book.public_reward_granted);
    assert_eq!(h.db.get_user(user).await.unwrap().points, 55);

    for status in [BookStatus::Private, BookStatus::Public, BookStatus::Community, BookStatus::Public] {
        let change = h.studio.set_visibility(user, book.id, status).await.unwrap();
        assert!(!change.rewarded);
        assert_eq!(change.book.status, status);
    }

    assert_eq!(h.db.get_user(user).await.unwrap().points, 55);
    let rewards = h
        .db
        .get_point_history(user)
        .await
        .unwrap()
        .into_iter()
        .filter(|entry| entry.reason == PointReason::PublicBookReward)
        .count();
    assert_eq!(rewards, 1);
}

#[tokio::test]
async fn publishing_without_going_public_pays_nothing() {
    let h = harness();
    let user = h.db.seed_user(100).unwrap();
    let book = h.studio.generate_book(user, request(5), None).await.unwrap();

    let change = h
        .studio
        .set_visibility(user, book.id, BookStatus::Published)
        .await
        .unwrap();
    assert!(!change.rewarded);
    assert!(!change.book.public_reward_granted);
    assert_eq!(h.db.get_user(user).await.unwrap().points, 25);
}

#[tokio::test]
async fn visibility_of_another_users_book_is_forbidden() {
    let h = harness();
    let owner = h.db.seed_user(100).unwrap();
    let other = h.db.seed_user(0).unwrap();
    let book = h.studio.generate_book(owner, request(5), None).await.unwrap();

    let err = h
        .studio
        .set_visibility(other, book.id, BookStatus::Public)
        .await
        .unwrap_err();
    assert!(matches!(err, PortError::Forbidden(_)));
    assert_eq!(h.db.get_user(other).await.unwrap().points, 0);
}

#[tokio::test]
async fn rejected_generation_writes_no_history() {
    let h = harness();
    let user = h.db.seed_user(20).unwrap();
    let before = h.db.history_count();

    let err = h.studio.generate_book(user, request(5), None).await.unwrap_err();
    assert!(matches!(
        err,
        PortError::InsufficientCredits { required: 75, current: 20 }
    ));
    assert_eq!(h.db.history_count(), before);
    assert_eq!(h.db.get_user(user).await.unwrap().points, 20);
}
