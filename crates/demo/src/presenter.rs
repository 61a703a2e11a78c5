use sabycom::{Banner, BannerError, BannerPresenter};

/// Draws the message banner as lines on stdout.
#[derive(Debug, Default)]
pub struct StdoutBannerPresenter;

fn render(banner: &Banner) -> String {
    let title = if banner.title.is_empty() {
        "New message"
    } else {
        banner.title.as_str()
    };
    format!(
        "[{}] {title}: {} ({} unread, `tap` to open)",
        banner.anchor, banner.body, banner.unread_count
    )
}

impl BannerPresenter for StdoutBannerPresenter {
    fn present(&self, banner: &Banner) -> Result<(), BannerError> {
        println!("banner ▸ {}", render(banner));
        Ok(())
    }

    fn update(&self, banner: &Banner) -> Result<(), BannerError> {
        println!("banner ↻ {}", render(banner));
        Ok(())
    }

    fn dismiss(&self) -> Result<(), BannerError> {
        println!("banner ✕");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untitled_banner_gets_a_default_title() {
        let banner = Banner {
            notification_id: "n1".to_string(),
            title: String::new(),
            body: "hi".to_string(),
            avatar_url: None,
            unread_count: 2,
            anchor: "terminal".to_string(),
        };
        assert_eq!(
            render(&banner),
            "[terminal] New message: hi (2 unread, `tap` to open)"
        );
    }
}
