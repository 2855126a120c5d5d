use lazy_regex::regex;

/// Site urls are the domain the site is served on, so they must be a plain lowercase hostname with
/// at least one dot, at most 253 characters long.
pub fn is_valid_site_url(site_url: &str) -> Result<(), String> {
    let hostname = regex!(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z][a-z0-9-]{0,61}[a-z0-9]$");

    if site_url.len() > 253 {
        return Err("length cannot be greater than 253".to_string());
    }

    if !hostname.is_match(site_url) {
        return Err(
            "must be a lowercase domain name such as 'joes-pizza.com'; no scheme, path or port"
                .to_string(),
        );
    }

    Ok(())
}

/// User ids feed repository names, so they need enough alphanumeric characters to tell users
/// apart.
pub fn is_valid_user_id(user_id: &str) -> Result<(), String> {
    if user_id.trim().is_empty() {
        return Err("cannot be empty".to_string());
    }

    if user_id.len() > 128 {
        return Err("length cannot be greater than 128".to_string());
    }

    if user_id.chars().filter(|c| c.is_ascii_alphanumeric()).count() < 8 {
        return Err("must contain at least 8 alphanumeric characters".to_string());
    }

    Ok(())
}

pub fn is_valid_slot(slot: u32, capacity: u32) -> Result<(), String> {
    if slot >= capacity {
        return Err(format!("must be less than the slot capacity of {capacity}"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("joes-pizza.com", true)]
    #[case("shop.joes-pizza.co.uk", true)]
    #[case("a1.io", true)]
    #[case("localhost", false)]
    #[case("Joes-Pizza.com", false)]
    #[case("https://joes-pizza.com", false)]
    #[case("joes-pizza.com/menu", false)]
    #[case("-joes.com", false)]
    #[case("joes..com", false)]
    fn site_urls(#[case] site_url: &str, #[case] valid: bool) {
        assert_eq!(is_valid_site_url(site_url).is_ok(), valid);
    }

    #[test]
    fn user_ids_need_enough_alphanumerics() {
        assert!(is_valid_user_id("4f1c2a9e-77aa-4a43").is_ok());
        assert!(is_valid_user_id("ab-cd").is_err());
        assert!(is_valid_user_id("   ").is_err());
    }

    #[test]
    fn slots_must_fit_capacity() {
        assert!(is_valid_slot(0, 10).is_ok());
        assert!(is_valid_slot(9, 10).is_ok());
        assert!(is_valid_slot(10, 10).is_err());
    }
}
