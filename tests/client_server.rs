use ldap_engine::config::EntryConfig;
use ldap_engine::filter::Filter;
use ldap_engine::protocol::{SearchRequest, SearchScope};
use ldap_engine::queue::Queue;
use ldap_engine::result_code;
use ldap_engine::sasl::Plain;
use ldap_engine::transport::Transport;
use ldap_engine::{ClientOptions, Config, LdapClient, LdapServer, MemoryDirectory, Metrics, ServerOptions};
use std::sync::Arc;
use tokio::task::JoinHandle;

const DIRECTORY: &str = r#"
entries:
  - dn: dc=example,dc=com
    attributes:
      objectClass: [domain]
      dc: [example]
  - dn: ou=people,dc=example,dc=com
    attributes:
      objectClass: [organizationalUnit]
  - dn: cn=foo,ou=people,dc=example,dc=com
    attributes:
      objectClass: [person]
      uid: [foo]
      userPassword: [bar]
  - dn: cn=alice,ou=people,dc=example,dc=com
    attributes:
      objectClass: [person]
      uid: [alice]
  - dn: cn=bob,ou=people,dc=example,dc=com
    attributes:
      objectClass: [person]
      uid: [bob]
"#;

fn entries() -> Vec<EntryConfig> {
    Config::from_str(DIRECTORY).unwrap().entries
}

/// A client wired to a freshly spawned server connection over an in-memory pipe.
fn connect(options: ServerOptions, metrics: Arc<Metrics>) -> (LdapClient, JoinHandle<()>) {
    let directory = MemoryDirectory::from_config(&entries()).unwrap();
    let server = LdapServer::new(options, Arc::new(directory), metrics, None);
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(async move {
        server.serve(Transport::memory(server_side), "memory").await;
    });
    let channel = Queue::new(Transport::memory(client_side));
    let client = LdapClient::with_channel(ClientOptions::new(["memory"]), Box::new(channel));
    (client, task)
}

fn people() -> SearchRequest {
    SearchRequest::new(
        "ou=people,dc=example,dc=com",
        SearchScope::SingleLevel,
        Filter::present("objectClass"),
    )
}

#[tokio::test]
async fn test_bind_search_and_unbind() {
    let metrics = Arc::new(Metrics::new());
    let (mut client, task) = connect(ServerOptions::default(), metrics.clone());

    let err = client.search(people(), vec![]).await.unwrap_err();
    assert_eq!(err.code(), Some(result_code::INSUFFICIENT_ACCESS_RIGHTS));

    let err = client.bind("cn=foo,ou=people,dc=example,dc=com", "wrong").await.unwrap_err();
    assert_eq!(err.code(), Some(result_code::INVALID_CREDENTIALS));

    let response = client.bind("cn=foo,ou=people,dc=example,dc=com", "bar").await.unwrap();
    assert!(response.op.result().unwrap().is_success());
    assert_eq!(client.whoami().await.unwrap(), "dn:cn=foo,ou=people,dc=example,dc=com");

    let found = client.search(people(), vec![]).await.unwrap();
    assert_eq!(found.entries.len(), 3);
    assert!(found.result.is_success());

    assert!(client.compare("cn=alice,ou=people,dc=example,dc=com", "uid", "alice").await.unwrap());

    client.unbind().await.unwrap();
    task.await.unwrap();
    assert_eq!(metrics.active_connections(), 0);
    assert_eq!(metrics.requests("search"), 1);
    assert_eq!(metrics.errors("search"), 1);
}

#[tokio::test]
async fn test_root_dse_without_authentication() {
    let (mut client, task) = connect(ServerOptions::default(), Arc::new(Metrics::new()));
    let dse = client.root_dse(false).await.unwrap();
    assert_eq!(dse.first_str("supportedLDAPVersion"), Some("3"));
    assert!(dse
        .get("supportedControl")
        .is_some_and(|c| c.contains(ldap_engine::control::PAGING_OID.as_bytes())));
    assert_eq!(client.whoami().await.unwrap(), "");
    client.unbind().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_sasl_plain_bind() {
    let (mut client, task) = connect(ServerOptions::default(), Arc::new(Metrics::new()));
    let mut plain = Plain::new("foo", "bar");
    client.sasl_bind(&mut plain).await.unwrap();
    assert_eq!(client.whoami().await.unwrap(), "dn:cn=foo,ou=people,dc=example,dc=com");
    client.unbind().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_paged_search() {
    let options = ServerOptions {
        require_authentication: false,
        ..Default::default()
    };
    let (mut client, task) = connect(options, Arc::new(Metrics::new()));
    let request = SearchRequest::new(
        "dc=example,dc=com",
        SearchScope::WholeSubtree,
        Filter::present("objectClass"),
    );
    let mut seen = Vec::new();
    let mut pages = 0;
    {
        let mut paging = client.paging(request, Some(2));
        while paging.has_entries() {
            let page = paging.get_entries(None).await.unwrap();
            assert!(page.len() <= 2);
            seen.extend(page.into_iter().map(|e| e.dn));
            pages += 1;
        }
        assert!(paging.cookie().is_empty());
    }
    assert_eq!(pages, 3);
    assert_eq!(seen.len(), 5);
    assert!(seen.contains(&"cn=bob,ou=people,dc=example,dc=com".to_string()));

    client.unbind().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_abandoned_paged_search() {
    let options = ServerOptions {
        require_authentication: false,
        ..Default::default()
    };
    let (mut client, task) = connect(options, Arc::new(Metrics::new()));
    {
        let mut paging = client.paging(people(), Some(1));
        assert_eq!(paging.get_entries(None).await.unwrap().len(), 1);
        paging.end().await.unwrap();
        assert!(!paging.has_entries());
    }
    let found = client.search(people(), vec![]).await.unwrap();
    assert_eq!(found.entries.len(), 3);
    client.unbind().await.unwrap();
    task.await.unwrap();
}
