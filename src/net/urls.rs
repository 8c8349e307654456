//! Endpoint and referer policy for the two upstream hosts
//!
//! All paths hang off configurable base URLs so the test harness can point
//! the whole agent at a mock server. The referer rules mirror the site's
//! own navigation: listing pages claim to come from the help page, action
//! endpoints claim to come from the listing page.

use crate::config::NetConfig;

/// Resolved URL set for one configuration.
#[derive(Debug, Clone)]
pub struct Endpoints {
    iaaa_base: String,
    elective_base: String,
}

impl Endpoints {
    #[must_use]
    pub fn new(net: &NetConfig) -> Self {
        Self {
            iaaa_base: net.iaaa_base_url.trim_end_matches('/').to_string(),
            elective_base: net.elective_base_url.trim_end_matches('/').to_string(),
        }
    }

    #[must_use]
    pub fn oauth_home(&self) -> String {
        format!("{}/oauth/home", self.iaaa_base)
    }

    #[must_use]
    pub fn oauth_login(&self) -> String {
        format!("{}/oauth/login", self.iaaa_base)
    }

    #[must_use]
    pub fn sso_login(&self) -> String {
        format!("{}/ssoLogin", self.elective_base)
    }

    #[must_use]
    pub fn sso_login_dual_degree(&self, sida: &str, sttp: &str) -> String {
        format!("{}/ssoLogin?sida={sida}&sttp={sttp}", self.elective_base)
    }

    #[must_use]
    pub fn logout(&self) -> String {
        format!("{}/logout", self.elective_base)
    }

    #[must_use]
    pub fn help_controller(&self) -> String {
        format!("{}/HelpController", self.elective_base)
    }

    #[must_use]
    pub fn supply_cancel(&self, student_id: &str) -> String {
        format!("{}/SupplyCancel?xh={student_id}", self.elective_base)
    }

    #[must_use]
    pub fn supplement(&self, student_id: &str, page: u32) -> String {
        format!("{}/Supplement?xh={student_id}&page={page}", self.elective_base)
    }

    #[must_use]
    pub fn draw_servlet(&self) -> String {
        format!("{}/DrawServlet", self.elective_base)
    }

    #[must_use]
    pub fn validate(&self) -> String {
        format!("{}/validate.do", self.elective_base)
    }

    /// Join a listing-page action href to the elective origin. Hrefs are
    /// opaque; absolute ones pass through untouched.
    #[must_use]
    pub fn elect_supplement(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            return href.to_string();
        }
        match url::Url::parse(&self.elective_base)
            .ok()
            .and_then(|base| base.join(href).ok())
        {
            Some(joined) => joined.to_string(),
            None => format!("{}{href}", self.elective_base),
        }
    }

    /// Referer carried by listing-page requests.
    #[must_use]
    pub fn listing_referer(&self) -> String {
        self.help_controller()
    }

    /// Referer carried by Draw/Validate/Elect requests.
    #[must_use]
    pub fn action_referer(&self, student_id: &str) -> String {
        self.supply_cancel(student_id)
    }

    /// Host portion of the elective base, for per-host rate buckets.
    #[must_use]
    pub fn elective_host(&self) -> Option<String> {
        url::Url::parse(&self.elective_base)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }

    /// Host portion of the IAAA base, for per-host rate buckets.
    #[must_use]
    pub fn iaaa_host(&self) -> Option<String> {
        url::Url::parse(&self.iaaa_base)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Endpoints {
        Endpoints::new(&NetConfig {
            iaaa_base_url: "https://iaaa.example.edu/iaaa".to_string(),
            elective_base_url: "https://elective.example.edu/elective2008".to_string(),
        })
    }

    #[test]
    fn test_listing_urls() {
        let ep = endpoints();
        assert_eq!(
            ep.supply_cancel("2200012345"),
            "https://elective.example.edu/elective2008/SupplyCancel?xh=2200012345"
        );
        assert_eq!(
            ep.supplement("2200012345", 2),
            "https://elective.example.edu/elective2008/Supplement?xh=2200012345&page=2"
        );
    }

    #[test]
    fn test_elect_href_join() {
        let ep = endpoints();
        // Origin-relative hrefs replace the base path.
        assert_eq!(
            ep.elect_supplement("/elective2008/edu/electSupplement.do?index=1"),
            "https://elective.example.edu/elective2008/edu/electSupplement.do?index=1"
        );
        assert_eq!(
            ep.elect_supplement("https://other.example.edu/x"),
            "https://other.example.edu/x"
        );
    }

    #[test]
    fn test_referers_follow_site_navigation() {
        let ep = endpoints();
        assert_eq!(ep.listing_referer(), ep.help_controller());
        assert!(ep.action_referer("1").contains("SupplyCancel"));
    }

    #[test]
    fn test_hosts() {
        let ep = endpoints();
        assert_eq!(ep.elective_host().as_deref(), Some("elective.example.edu"));
        assert_eq!(ep.iaaa_host().as_deref(), Some("iaaa.example.edu"));
    }
}
